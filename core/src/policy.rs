//! The policy gate: a pure decision function over (context, proposed call).
//!
//! `decide` folds three layers in a fixed order — hard invariants, the
//! versioned decision matrix, durable user overrides — and is deterministic:
//! the same inputs and matrix version always produce byte-identical
//! decisions. Reason codes are the API surface for the UI and the audit log;
//! they are a closed set and user-facing copy derives from them locally.

use std::collections::HashMap;
use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use uuid::Uuid;
use wildmatch::WildMatch;

use webpilot_protocol::DocumentIdentity;
use webpilot_protocol::Mode;
use webpilot_protocol::Observation;
use webpilot_protocol::PageBinding;

use crate::classify;
use crate::classify::FieldClass;
use crate::error::CoreErr;
use crate::error::Result;
use crate::tools::ToolArgs;
use crate::tools::ToolCategory;
use crate::tools::ToolSpec;

/// Embedded default matrix; `policy.matrix_version` in the config selects
/// nothing else today, but the version string is recorded into every
/// decision so old logs stay interpretable.
const DEFAULT_MATRIX_TOML: &str = include_str!("default_policy.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    Allow,
    Ask,
    Deny,
}

/// Stable reason codes. Wire form is the SCREAMING_SNAKE string; `P_` for
/// policy decisions, `C_` for classifier outcomes, `A_` for audit flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ReasonCode {
    #[serde(rename = "P_ALLOW_MATRIX")]
    #[strum(serialize = "P_ALLOW_MATRIX")]
    MatrixAllow,
    #[serde(rename = "P_ASK_MATRIX")]
    #[strum(serialize = "P_ASK_MATRIX")]
    MatrixAsk,
    #[serde(rename = "P_DENY_MATRIX")]
    #[strum(serialize = "P_DENY_MATRIX")]
    MatrixDeny,
    #[serde(rename = "P_ALLOW_OBSERVATION")]
    #[strum(serialize = "P_ALLOW_OBSERVATION")]
    ObservationAllowed,
    #[serde(rename = "P_DENY_MODE_READ_ONLY")]
    #[strum(serialize = "P_DENY_MODE_READ_ONLY")]
    ModeReadOnly,
    #[serde(rename = "P_DENY_PAYMENT_FIELD")]
    #[strum(serialize = "P_DENY_PAYMENT_FIELD")]
    PaymentField,
    #[serde(rename = "P_DENY_CREDENTIAL_FIELD")]
    #[strum(serialize = "P_DENY_CREDENTIAL_FIELD")]
    CredentialField,
    #[serde(rename = "P_ALLOW_FIELD_OVERRIDE")]
    #[strum(serialize = "P_ALLOW_FIELD_OVERRIDE")]
    FieldOverrideAllowed,
    #[serde(rename = "P_DENY_CROSS_ORIGIN_CARRY")]
    #[strum(serialize = "P_DENY_CROSS_ORIGIN_CARRY")]
    CrossOriginCarryDenied,
    #[serde(rename = "P_ALLOW_CROSS_ORIGIN_INTENT")]
    #[strum(serialize = "P_ALLOW_CROSS_ORIGIN_INTENT")]
    CrossOriginIntentAllowed,
    #[serde(rename = "P_DENY_UNKNOWN_TOOL")]
    #[strum(serialize = "P_DENY_UNKNOWN_TOOL")]
    UnknownTool,
    #[serde(rename = "P_DENY_BINDING_MISMATCH")]
    #[strum(serialize = "P_DENY_BINDING_MISMATCH")]
    BindingMismatch,
    #[serde(rename = "P_ASK_CLASSIFIER_UNCERTAIN")]
    #[strum(serialize = "P_ASK_CLASSIFIER_UNCERTAIN")]
    ClassifierUncertain,
    #[serde(rename = "P_DENY_SITE_BLOCKED")]
    #[strum(serialize = "P_DENY_SITE_BLOCKED")]
    SiteBlockedByUser,
    #[serde(rename = "P_ASK_INJECTION_SUSPECTED")]
    #[strum(serialize = "P_ASK_INJECTION_SUSPECTED")]
    InjectionSuspectedAsk,
    #[serde(rename = "P_DENY_LOCKED")]
    #[strum(serialize = "P_DENY_LOCKED")]
    ServiceLocked,
    #[serde(rename = "P_ALLOW_SESSION_APPROVAL")]
    #[strum(serialize = "P_ALLOW_SESSION_APPROVAL")]
    SessionApprovalAllowed,
    #[serde(rename = "P_GESTURE_REQUIRED")]
    #[strum(serialize = "P_GESTURE_REQUIRED")]
    GestureRequired,
    #[serde(rename = "A_AUTONOMY_DOWNGRADED")]
    #[strum(serialize = "A_AUTONOMY_DOWNGRADED")]
    AutonomyDowngraded,
    #[serde(rename = "A_INJECTION_SUSPECTED")]
    #[strum(serialize = "A_INJECTION_SUSPECTED")]
    InjectionSuspected,
    #[serde(rename = "A_OVERLAY_SUSPECTED")]
    #[strum(serialize = "A_OVERLAY_SUSPECTED")]
    OverlaySuspected,
    #[serde(rename = "A_UNGROUNDED_FALLBACK")]
    #[strum(serialize = "A_UNGROUNDED_FALLBACK")]
    UngroundedFallback,
    #[serde(rename = "C_FIELD_PASSWORD_TYPE")]
    #[strum(serialize = "C_FIELD_PASSWORD_TYPE")]
    ClassifierPasswordType,
    #[serde(rename = "C_FIELD_AUTOCOMPLETE")]
    #[strum(serialize = "C_FIELD_AUTOCOMPLETE")]
    ClassifierAutocomplete,
    #[serde(rename = "C_FIELD_NAME_HEURISTIC")]
    #[strum(serialize = "C_FIELD_NAME_HEURISTIC")]
    ClassifierNameHeuristic,
    #[serde(rename = "C_TEXT_SECRET")]
    #[strum(serialize = "C_TEXT_SECRET")]
    ClassifierTextSecret,
    #[serde(rename = "C_FIELD_INSUFFICIENT_METADATA")]
    #[strum(serialize = "C_FIELD_INSUFFICIENT_METADATA")]
    ClassifierInsufficient,
    #[serde(rename = "C_FIELD_GENERIC")]
    #[strum(serialize = "C_FIELD_GENERIC")]
    ClassifierGeneric,
}

/// Risk class of an origin as seen by the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SiteRisk {
    Low,
    Standard,
    Sensitive,
}

/// Durable per-site label set by the user. The label wins over heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteLabel {
    Trusted,
    Sensitive,
    Blocked,
}

/// Field-level exception allowing mutation of a credential field. Narrowly
/// scoped and expiring; the only sanctioned way past that hard invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOverride {
    pub origin: String,
    /// Matches the field's `name` or label, case-insensitively.
    pub field_name: String,
    pub expires_at_ms: Option<u64>,
}

/// Durable user overrides, reconstructed from profile storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserOverrides {
    pub site_labels: HashMap<String, SiteLabel>,
    pub field_overrides: Vec<FieldOverride>,
}

impl UserOverrides {
    fn field_override_for(&self, origin: &str, names: &[&str], now_ms: u64) -> Option<&FieldOverride> {
        self.field_overrides.iter().find(|ov| {
            ov.origin == origin
                && ov.expires_at_ms.is_none_or(|exp| exp > now_ms)
                && names
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(&ov.field_name))
        })
    }
}

/// An active cross-origin carry grant, derived from a
/// `user.cross_site_intent` event. Run-scoped; the source document identity
/// is pinned at grant time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossSiteGrant {
    pub from_origin: String,
    pub to_origin: String,
    pub source_document: DocumentIdentity,
}

#[derive(Debug, Clone, Deserialize)]
struct MatrixRule {
    category: ToolCategory,
    mode: Mode,
    site_risk: SiteRisk,
    decision: Decision,
    gesture: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct MatrixToml {
    version: String,
    #[serde(rename = "rule")]
    rules: Vec<MatrixRule>,
}

/// The versioned data-driven decision table, loaded once at startup.
#[derive(Debug, Clone)]
pub struct DecisionMatrix {
    version: String,
    rules: Vec<MatrixRule>,
}

impl DecisionMatrix {
    pub fn load_default() -> Result<Self> {
        Self::parse(DEFAULT_MATRIX_TOML)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let parsed: MatrixToml = toml::from_str(text)
            .map_err(|e| CoreErr::SchemaViolation(format!("policy matrix: {e}")))?;
        Ok(Self {
            version: parsed.version,
            rules: parsed.rules,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn lookup(&self, category: ToolCategory, mode: Mode, risk: SiteRisk) -> Option<(Decision, bool)> {
        self.rules
            .iter()
            .find(|r| r.category == category && r.mode == mode && r.site_risk == risk)
            .map(|r| (r.decision, r.gesture))
    }
}

/// The gate's verdict, bound to the page state it was decided against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub reason_code: ReasonCode,
    pub requires_gesture: bool,
    pub binding: PageBinding,
    pub matrix_version: String,
}

/// Inputs to one `decide` call. Everything is data; `now_ms` is passed in so
/// the function stays pure.
pub struct PolicyCtx<'a> {
    pub mode: Mode,
    pub binding: &'a PageBinding,
    pub observation: Option<&'a Observation>,
    pub cross_site_grants: &'a [CrossSiteGrant],
    pub overrides: &'a UserOverrides,
    pub session_approvals: &'a HashSet<String>,
    /// Curated wildcard patterns for origins that are sensitive by default.
    pub curated_sensitive: &'a [String],
    pub injection_flagged: bool,
    pub locked: bool,
    pub matrix: &'a DecisionMatrix,
    pub now_ms: u64,
}

/// One proposed tool call, resolved against the registry.
pub struct ProposedCall<'a> {
    pub spec: &'static ToolSpec,
    pub args: &'a ToolArgs,
    pub request_id: Uuid,
    /// Origin the typed content was sourced from, when the orchestrator
    /// knows it differs from the target origin.
    pub carry_from_origin: Option<&'a str>,
}

impl<'a> ProposedCall<'a> {
    /// Approval-for-session scope key: identical (tool, redacted arguments,
    /// document) proposals share one.
    pub fn scope_key(&self, document_id: &str) -> Result<String> {
        Ok(format!(
            "{}:{}:{}",
            self.spec.name,
            self.args.digest()?,
            document_id
        ))
    }
}

fn decision(
    ctx: &PolicyCtx<'_>,
    decision: Decision,
    reason_code: ReasonCode,
    requires_gesture: bool,
) -> PolicyDecision {
    PolicyDecision {
        decision,
        reason_code,
        requires_gesture,
        binding: ctx.binding.clone(),
        matrix_version: ctx.matrix.version.clone(),
    }
}

/// Classify an origin's risk: user label wins, then page heuristics
/// (password fields, payment affordances), then the curated list.
pub fn classify_origin(
    origin: &str,
    overrides: &UserOverrides,
    observation: Option<&Observation>,
    curated_sensitive: &[String],
) -> SiteRisk {
    match overrides.site_labels.get(origin) {
        Some(SiteLabel::Trusted) => return SiteRisk::Low,
        Some(SiteLabel::Sensitive) | Some(SiteLabel::Blocked) => return SiteRisk::Sensitive,
        None => {}
    }

    if let Some(obs) = observation {
        let has_sensitive_affordance = obs.interactive.iter().any(|el| {
            let class = classify::classify_field(el, None);
            class.certain
                && matches!(class.field, FieldClass::Credential | FieldClass::Payment)
        });
        if has_sensitive_affordance {
            return SiteRisk::Sensitive;
        }
    }

    if curated_sensitive
        .iter()
        .any(|pattern| WildMatch::new(pattern).matches(origin))
    {
        return SiteRisk::Sensitive;
    }

    SiteRisk::Standard
}

/// Deterministic allow/ask/deny for one proposed tool call.
pub fn decide(ctx: &PolicyCtx<'_>, call: &ProposedCall<'_>) -> PolicyDecision {
    // Hard invariants first; each emits its own reason code.
    if ctx.locked {
        return decision(ctx, Decision::Deny, ReasonCode::ServiceLocked, false);
    }
    if ctx.mode == Mode::ReadOnly && call.spec.is_mutating() {
        return decision(ctx, Decision::Deny, ReasonCode::ModeReadOnly, false);
    }

    // The handle space is authoritative only within the observation's
    // document identity; anything else is a binding mismatch.
    let Some(observation) = ctx.observation else {
        return decision(ctx, Decision::Deny, ReasonCode::BindingMismatch, false);
    };
    if observation.document != ctx.binding.document || observation.origin != ctx.binding.origin {
        return decision(ctx, Decision::Deny, ReasonCode::BindingMismatch, false);
    }

    let target = match call.args.target_handle() {
        Some(handle) => match observation.element(handle) {
            Some(element) => Some(element),
            None => {
                return decision(ctx, Decision::Deny, ReasonCode::BindingMismatch, false);
            }
        },
        None => None,
    };

    // Sensitive-field invariants.
    let mut field_override_used = false;
    let mut field_risk = SiteRisk::Low;
    if let Some(element) = target {
        let class = classify::classify_field(element, call.args.typed_text());
        if !class.certain {
            return decision(ctx, Decision::Ask, ReasonCode::ClassifierUncertain, false);
        }
        match class.combined {
            FieldClass::Payment => {
                // Payments are denied unconditionally; no override widens
                // past this.
                return decision(ctx, Decision::Deny, ReasonCode::PaymentField, false);
            }
            FieldClass::Credential => {
                let mut names: Vec<&str> = vec![element.accessible_name.as_str()];
                if let Some(meta) = &element.form {
                    if let Some(name) = &meta.name {
                        names.push(name);
                    }
                    if let Some(label) = &meta.label {
                        names.push(label);
                    }
                }
                match ctx
                    .overrides
                    .field_override_for(&ctx.binding.origin, &names, ctx.now_ms)
                {
                    Some(_) => field_override_used = true,
                    None => {
                        return decision(
                            ctx,
                            Decision::Deny,
                            ReasonCode::CredentialField,
                            false,
                        );
                    }
                }
            }
            FieldClass::Sso | FieldClass::Pii => field_risk = SiteRisk::Sensitive,
            FieldClass::Generic => {}
        }
    }

    // Cross-origin carry from a sensitive origin needs a matching grant.
    if let Some(source_origin) = call.carry_from_origin {
        let source_risk =
            classify_origin(source_origin, ctx.overrides, None, ctx.curated_sensitive);
        if source_risk == SiteRisk::Sensitive {
            let granted = ctx.cross_site_grants.iter().any(|grant| {
                grant.from_origin == source_origin && grant.to_origin == ctx.binding.origin
            });
            if !granted {
                return decision(ctx, Decision::Deny, ReasonCode::CrossOriginCarryDenied, false);
            }
        }
    }

    // Suspected injection: nothing runs on that content without an explicit
    // confirmation.
    if ctx.injection_flagged {
        return decision(ctx, Decision::Ask, ReasonCode::InjectionSuspectedAsk, true);
    }

    if let Some(SiteLabel::Blocked) = ctx.overrides.site_labels.get(&ctx.binding.origin) {
        return decision(ctx, Decision::Deny, ReasonCode::SiteBlockedByUser, false);
    }

    // A prior approval-for-session on the identical proposal short-circuits
    // the matrix (hard invariants were already enforced above).
    if let Ok(key) = call.scope_key(&ctx.binding.document.document_id)
        && ctx.session_approvals.contains(&key)
    {
        return decision(ctx, Decision::Allow, ReasonCode::SessionApprovalAllowed, false);
    }

    // Data-driven matrix.
    let site_risk = classify_origin(
        &ctx.binding.origin,
        ctx.overrides,
        ctx.observation,
        ctx.curated_sensitive,
    )
    .max(field_risk);

    match ctx.matrix.lookup(call.spec.category, ctx.mode, site_risk) {
        Some((Decision::Allow, gesture)) => {
            let reason = if field_override_used {
                ReasonCode::FieldOverrideAllowed
            } else {
                ReasonCode::MatrixAllow
            };
            decision(ctx, Decision::Allow, reason, gesture)
        }
        Some((Decision::Ask, gesture)) => decision(ctx, Decision::Ask, ReasonCode::MatrixAsk, gesture),
        Some((Decision::Deny, gesture)) => decision(ctx, Decision::Deny, ReasonCode::MatrixDeny, gesture),
        // Fail closed on a hole in the table.
        None => decision(ctx, Decision::Deny, ReasonCode::MatrixDeny, false),
    }
}

/// Decision record for an observation. Observations are read-only and always
/// allowed; they are recorded so every step of the run has its gate entry.
pub fn decide_observation(binding: &PageBinding, matrix: &DecisionMatrix) -> PolicyDecision {
    PolicyDecision {
        decision: Decision::Allow,
        reason_code: ReasonCode::ObservationAllowed,
        requires_gesture: false,
        binding: binding.clone(),
        matrix_version: matrix.version.clone(),
    }
}

/// Decision for a proposal naming a tool outside the registry.
pub fn deny_unknown_tool(binding: &PageBinding, matrix: &DecisionMatrix) -> PolicyDecision {
    PolicyDecision {
        decision: Decision::Deny,
        reason_code: ReasonCode::UnknownTool,
        requires_gesture: false,
        binding: binding.clone(),
        matrix_version: matrix.version.clone(),
    }
}
