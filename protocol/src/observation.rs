//! The sanitized page snapshot the extraction layer hands to the core.
//!
//! An observation is the only page-derived input the planner ever sees, so
//! the shape is deliberately narrow: visible text and an interactive-element
//! roster, never raw markup, never input values, never hidden-node content.
//! The core re-screens every observation at ingestion and records what it
//! dropped as [`RedactionNote`]s so the planner does not hallucinate the
//! missing content back into existence.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::binding::DocumentIdentity;

/// A contiguous run of visible text. Segments are the citation unit: an
/// answer document cites `segment_index` ranges, and the grounding check
/// verifies claims against them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextSegment {
    pub segment_index: u32,
    pub text: String,
}

/// Viewport-relative box, CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Metadata for a form control, used by the field classifier. Carries hints
/// only; the value the user may have typed into the control is never
/// captured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormFieldMeta {
    /// The `type` attribute for inputs (`text`, `password`, `email`, ...).
    pub input_type: Option<String>,
    /// Best-effort associated label text.
    pub label: Option<String>,
    pub required: bool,
    /// The `autocomplete` token list, verbatim.
    pub autocomplete: Option<String>,
    /// The `name` attribute. Allowlisted because classifiers need it.
    pub name: Option<String>,
}

/// One entry in the interactive-element roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InteractiveElement {
    /// Opaque handle minted by the extraction layer. The core never parses
    /// it; it is only compared for membership against later tool calls.
    pub handle: String,
    /// ARIA role or tag-derived fallback (`button`, `link`, `textbox`, ...).
    pub role: String,
    pub accessible_name: String,
    pub bounds: BoundingBox,
    #[serde(default)]
    pub form: Option<FormFieldMeta>,
    /// Allowlisted attributes only (`href`, `disabled`, ...). The extraction
    /// layer enforces the allowlist; the core drops anything else.
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
}

/// Page-level conditions the planner and policy gate need to know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccessSignal {
    Paywall,
    LoginGate,
    /// A modal or overlay is covering meaningful content.
    Overlay,
    Captcha,
    /// A virtualized list is present; visible text is a window, not the
    /// whole document.
    VirtualizedList,
}

/// Record of content removed during sanitization and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedactionNote {
    /// Stable machine-readable reason (`password_field`, `hidden_node`,
    /// `credential_like_text`, ...).
    pub reason: String,
    /// Human-readable summary, derived locally, never from page content.
    pub detail: String,
}

/// A bounded, redacted snapshot of page state for one document identity.
///
/// The handle space is authoritative only within `document`; a navigation
/// generation bump orphans every handle in `interactive`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub origin: String,
    pub document: DocumentIdentity,
    pub observed_at: DateTime<Utc>,
    pub visible_text: Vec<TextSegment>,
    pub interactive: Vec<InteractiveElement>,
    #[serde(default)]
    pub access_signals: Vec<AccessSignal>,
    #[serde(default)]
    pub redactions: Vec<RedactionNote>,
}

impl Observation {
    /// Look up an element by handle. Callers must have already checked that
    /// the document identity matches the one the handle was minted for.
    pub fn element(&self, handle: &str) -> Option<&InteractiveElement> {
        self.interactive.iter().find(|el| el.handle == handle)
    }

    pub fn has_signal(&self, signal: AccessSignal) -> bool {
        self.access_signals.contains(&signal)
    }

    /// Total visible-text length in characters, used for budget accounting.
    pub fn text_len(&self) -> usize {
        self.visible_text.iter().map(|s| s.text.len()).sum()
    }
}
