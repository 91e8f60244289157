//! The compact run snapshot the external UI renders from.
//!
//! This payload is rebuilt and emitted after every durable state transition.
//! It is a *projection*: nothing in it is authoritative, and nothing
//! sensitive may appear in it (no cookies, session tokens, capability
//! tokens, keys, raw markup, full page text, or typed form values).

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::binding::Mode;
use crate::binding::Surface;

/// What the user can do right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunControls {
    pub can_stop: bool,
    pub can_resume: bool,
    pub needs_gesture: bool,
}

/// Per-run portion of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Snake_case name of the current state-machine state.
    pub status: String,
    /// Origin + title of the attached target, already sanitized.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub attached_target: Option<String>,
    /// One-line description of the last completed action.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub last_action: Option<String>,
    /// One-line preview of the next proposed step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub next_step: Option<String>,
    /// Approval id the run is blocked on, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub pending_approval: Option<String>,
    /// Reason code of the most recent policy decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub last_reason_code: Option<String>,
}

/// Everything the UI needs in one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunStatePayload {
    /// Coarse app state (`ready`, `running`, `locked`).
    pub app_state: String,
    pub origin: String,
    pub mode: Mode,
    pub surface: Surface,
    pub run: RunSummary,
    pub controls: RunControls,
    /// The *next* policy decision only, as a reason code. Historical
    /// decisions live in the event log, not here.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub next_policy_decision: Option<String>,
}
