//! The typed tool surface.
//!
//! Exactly one schema version is active per release. Each tool is a record
//! of functions — argument validation, precondition, postcondition, argument
//! redaction — plus static metadata the policy gate and router key off. The
//! registry is closed: a proposal naming anything else is `UnknownTool`.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use strum_macros::Display;

use webpilot_protocol::Observation;

use crate::canonical;
use crate::error::CoreErr;
use crate::error::ErrorCode;
use crate::error::Result;

pub const TOOL_SCHEMA_VERSION: u32 = 1;

/// How the router treats repeat execution of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IdempotencyCategory {
    /// No page mutation; may run concurrently and retry freely.
    ReadOnly,
    /// Mutating but safe to repeat (scrolling).
    Repeatable,
    /// Must execute at most once per request id.
    SideEffectingOnce,
}

/// Coarse action category the policy matrix is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolCategory {
    Pointer,
    TextEntry,
    Selection,
    Scroll,
    Navigation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickArgs {
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeArgs {
    pub handle: String,
    pub text: String,
    /// Press Enter after typing.
    #[serde(default)]
    pub submit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectArgs {
    pub handle: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrollArgs {
    /// Scroll the element's nearest scroll container; the viewport when
    /// absent.
    #[serde(default)]
    pub handle: Option<String>,
    pub delta_y: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NavigateArgs {
    pub url: String,
}

/// Parsed, validated tool arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArgs {
    Click(ClickArgs),
    Type(TypeArgs),
    Select(SelectArgs),
    Scroll(ScrollArgs),
    Navigate(NavigateArgs),
}

impl ToolArgs {
    /// The element handle this call targets, if any.
    pub fn target_handle(&self) -> Option<&str> {
        match self {
            ToolArgs::Click(a) => Some(&a.handle),
            ToolArgs::Type(a) => Some(&a.handle),
            ToolArgs::Select(a) => Some(&a.handle),
            ToolArgs::Scroll(a) => a.handle.as_deref(),
            ToolArgs::Navigate(_) => None,
        }
    }

    /// Text the user's agent would enter into the page, if any. Policy needs
    /// it for classification; it never reaches the log.
    pub fn typed_text(&self) -> Option<&str> {
        match self {
            ToolArgs::Type(a) => Some(&a.text),
            _ => None,
        }
    }

    /// Loggable rendition of the arguments. Typed text is replaced by a
    /// digest and a length so the log can correlate without retaining it.
    pub fn redacted(&self) -> Value {
        match self {
            ToolArgs::Click(a) => json!({ "handle": a.handle }),
            ToolArgs::Type(a) => {
                let digest = canonical::sha256(a.text.as_bytes());
                json!({
                    "handle": a.handle,
                    "text_sha256": canonical::to_hex(&digest),
                    "text_len": a.text.chars().count(),
                    "submit": a.submit,
                })
            }
            ToolArgs::Select(a) => json!({ "handle": a.handle, "value": a.value }),
            ToolArgs::Scroll(a) => json!({ "handle": a.handle, "delta_y": a.delta_y }),
            ToolArgs::Navigate(a) => json!({ "url": a.url }),
        }
    }

    /// Digest of the redacted arguments, used for approval-for-session
    /// scope keys.
    pub fn digest(&self) -> Result<String> {
        let bytes = canonical::canonical_json_bytes(&self.redacted())?;
        Ok(canonical::to_hex(&canonical::sha256(&bytes)))
    }

    /// The wire arguments handed to the bridge. Identical to the proposal's
    /// arguments except for validation; includes typed text.
    pub fn to_wire(&self) -> Result<Value> {
        let value = match self {
            ToolArgs::Click(a) => serde_json::to_value(a)?,
            ToolArgs::Type(a) => serde_json::to_value(a)?,
            ToolArgs::Select(a) => serde_json::to_value(a)?,
            ToolArgs::Scroll(a) => serde_json::to_value(a)?,
            ToolArgs::Navigate(a) => serde_json::to_value(a)?,
        };
        Ok(value)
    }
}

fn parse<T: for<'de> Deserialize<'de>>(tool: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| CoreErr::SchemaViolation(format!("{tool}: {e}")))
}

fn require_element<'a>(
    observation: &'a Observation,
    handle: &str,
) -> Result<&'a webpilot_protocol::InteractiveElement> {
    observation
        .element(handle)
        .ok_or_else(|| CoreErr::StaleHandle(handle.to_string()))
}

fn require_interactable(observation: &Observation, handle: &str) -> Result<()> {
    let element = require_element(observation, handle)?;
    if element
        .attributes
        .iter()
        .any(|(key, value)| key == "disabled" && value != "false")
    {
        return Err(CoreErr::PreconditionFailed(format!(
            "element `{handle}` is disabled"
        )));
    }
    if observation.has_signal(webpilot_protocol::AccessSignal::Overlay) {
        return Err(CoreErr::Tool(ErrorCode::BlockedByOverlay));
    }
    Ok(())
}

/// Cheap structural fingerprint used by the "did anything visibly change"
/// postconditions.
fn page_fingerprint(observation: &Observation) -> Result<String> {
    let roster: Vec<&str> = observation.interactive.iter().map(|e| e.handle.as_str()).collect();
    let bytes = canonical::canonical_json_bytes(&json!({
        "url": observation.url,
        "title": observation.title,
        "nav_gen": observation.document.navigation_generation,
        "text": observation.visible_text,
        "roster": roster,
    }))?;
    Ok(canonical::to_hex(&canonical::sha256(&bytes)))
}

/// One tool: static metadata plus the behavior record.
pub struct ToolSpec {
    pub name: &'static str,
    pub category: ToolCategory,
    pub idempotency: IdempotencyCategory,
    /// Error codes this tool's executor may legitimately report.
    pub error_codes: &'static [ErrorCode],
    validate: fn(&Value) -> Result<ToolArgs>,
    precondition: fn(&ToolArgs, &Observation) -> Result<()>,
    postcondition: fn(&ToolArgs, &Observation, &Observation) -> Result<()>,
}

impl ToolSpec {
    pub fn validate(&self, arguments: &Value) -> Result<ToolArgs> {
        (self.validate)(arguments)
    }

    /// Checked against the latest observation before dispatch.
    pub fn precondition(&self, args: &ToolArgs, observation: &Observation) -> Result<()> {
        (self.precondition)(args, observation)
    }

    /// Checked against the fresh post-mutation observation. Failure means
    /// re-plan, never retry.
    pub fn postcondition(
        &self,
        args: &ToolArgs,
        before: &Observation,
        after: &Observation,
    ) -> Result<()> {
        (self.postcondition)(args, before, after)
    }

    pub fn is_mutating(&self) -> bool {
        self.idempotency != IdempotencyCategory::ReadOnly
    }
}

const EXEC_ERRORS: &[ErrorCode] = &[
    ErrorCode::StaleHandle,
    ErrorCode::NotFound,
    ErrorCode::NotInteractable,
    ErrorCode::BlockedByOverlay,
    ErrorCode::TimedOut,
    ErrorCode::Cancelled,
    ErrorCode::Unavailable,
    ErrorCode::PermissionRequired,
];

static TOOLS_V1: &[ToolSpec] = &[
    ToolSpec {
        name: "browser.click",
        category: ToolCategory::Pointer,
        idempotency: IdempotencyCategory::SideEffectingOnce,
        error_codes: EXEC_ERRORS,
        validate: |value| Ok(ToolArgs::Click(parse("browser.click", value)?)),
        precondition: |args, obs| match args {
            ToolArgs::Click(a) => require_interactable(obs, &a.handle),
            _ => Err(CoreErr::Internal("argument/tool mismatch".to_string())),
        },
        postcondition: |_args, before, after| {
            // A click with no observable consequence at all is treated as a
            // failed step so the planner reconsiders instead of looping.
            if page_fingerprint(before)? == page_fingerprint(after)? {
                return Err(CoreErr::VerificationFailed(
                    "click produced no observable change".to_string(),
                ));
            }
            Ok(())
        },
    },
    ToolSpec {
        name: "browser.type",
        category: ToolCategory::TextEntry,
        idempotency: IdempotencyCategory::SideEffectingOnce,
        error_codes: EXEC_ERRORS,
        validate: |value| {
            let args: TypeArgs = parse("browser.type", value)?;
            if args.text.is_empty() {
                return Err(CoreErr::SchemaViolation(
                    "browser.type: text must not be empty".to_string(),
                ));
            }
            Ok(ToolArgs::Type(args))
        },
        precondition: |args, obs| match args {
            ToolArgs::Type(a) => {
                require_interactable(obs, &a.handle)?;
                let element = require_element(obs, &a.handle)?;
                let is_password = element
                    .form
                    .as_ref()
                    .and_then(|f| f.input_type.as_deref())
                    .is_some_and(|t| t.eq_ignore_ascii_case("password"));
                if is_password {
                    // Policy denies this long before dispatch; the
                    // precondition is the backstop.
                    return Err(CoreErr::PreconditionFailed(
                        "target is a password field".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Err(CoreErr::Internal("argument/tool mismatch".to_string())),
        },
        postcondition: |args, before, after| {
            let ToolArgs::Type(a) = args else {
                return Err(CoreErr::Internal("argument/tool mismatch".to_string()));
            };
            // Submitting may navigate; otherwise the field must survive.
            let same_generation = before.document == after.document;
            if same_generation && after.element(&a.handle).is_none() {
                return Err(CoreErr::VerificationFailed(
                    "typed field disappeared without a navigation".to_string(),
                ));
            }
            Ok(())
        },
    },
    ToolSpec {
        name: "browser.select",
        category: ToolCategory::Selection,
        idempotency: IdempotencyCategory::SideEffectingOnce,
        error_codes: EXEC_ERRORS,
        validate: |value| Ok(ToolArgs::Select(parse("browser.select", value)?)),
        precondition: |args, obs| match args {
            ToolArgs::Select(a) => require_interactable(obs, &a.handle),
            _ => Err(CoreErr::Internal("argument/tool mismatch".to_string())),
        },
        postcondition: |args, before, after| {
            let ToolArgs::Select(a) = args else {
                return Err(CoreErr::Internal("argument/tool mismatch".to_string()));
            };
            if before.document == after.document && after.element(&a.handle).is_none() {
                return Err(CoreErr::VerificationFailed(
                    "select target disappeared without a navigation".to_string(),
                ));
            }
            Ok(())
        },
    },
    ToolSpec {
        name: "browser.scroll",
        category: ToolCategory::Scroll,
        idempotency: IdempotencyCategory::Repeatable,
        error_codes: EXEC_ERRORS,
        validate: |value| {
            let args: ScrollArgs = parse("browser.scroll", value)?;
            if args.delta_y == 0 {
                return Err(CoreErr::SchemaViolation(
                    "browser.scroll: delta_y must be non-zero".to_string(),
                ));
            }
            Ok(ToolArgs::Scroll(args))
        },
        precondition: |args, obs| match args {
            ToolArgs::Scroll(a) => match &a.handle {
                Some(handle) => require_element(obs, handle).map(|_| ()),
                None => Ok(()),
            },
            _ => Err(CoreErr::Internal("argument/tool mismatch".to_string())),
        },
        // Scrolling at the end of a document legitimately changes nothing.
        postcondition: |_args, _before, _after| Ok(()),
    },
    ToolSpec {
        name: "browser.navigate",
        category: ToolCategory::Navigation,
        idempotency: IdempotencyCategory::SideEffectingOnce,
        error_codes: EXEC_ERRORS,
        validate: |value| {
            let args: NavigateArgs = parse("browser.navigate", value)?;
            if !args.url.starts_with("https://") && !args.url.starts_with("http://") {
                return Err(CoreErr::SchemaViolation(
                    "browser.navigate: only http(s) urls are allowed".to_string(),
                ));
            }
            Ok(ToolArgs::Navigate(args))
        },
        precondition: |_args, _obs| Ok(()),
        postcondition: |args, _before, after| {
            let ToolArgs::Navigate(a) = args else {
                return Err(CoreErr::Internal("argument/tool mismatch".to_string()));
            };
            if !after.url.starts_with(a.url.trim_end_matches('/')) {
                return Err(CoreErr::VerificationFailed(format!(
                    "navigation landed on a different url than requested ({})",
                    after.url
                )));
            }
            Ok(())
        },
    },
];

/// The active tool registry. Exactly one schema version ships per release.
pub struct ToolRegistry {
    specs: &'static [ToolSpec],
}

impl ToolRegistry {
    pub fn v1() -> Self {
        Self { specs: TOOLS_V1 }
    }

    pub fn get(&self, name: &str) -> Option<&'static ToolSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.specs.iter().map(|spec| spec.name).collect()
    }

    /// Tools a capability token may carry in the given mode. Read-only mode
    /// grants no tools at all: observation is not a tool.
    pub fn allowed_in_mode(&self, mode: webpilot_protocol::Mode) -> Vec<String> {
        match mode {
            webpilot_protocol::Mode::ReadOnly => Vec::new(),
            webpilot_protocol::Mode::Assist | webpilot_protocol::Mode::Autopilot => {
                self.specs.iter().map(|s| s.name.to_string()).collect()
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::v1()
    }
}
