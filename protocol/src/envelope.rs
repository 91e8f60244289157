//! The message envelope spoken over the native-messaging bridge.
//!
//! Both sides validate against these schemas; unknown fields are a hard
//! error so schema drift surfaces as a loud failure instead of a silent
//! capability expansion.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::binding::PageBinding;
use crate::observation::Observation;
use crate::ui_state::RunStatePayload;

/// Bumped on any incompatible change to the envelope or message set. The
/// bridge refuses to talk across versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Stable framing around every bridge message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub protocol_version: u32,
    /// Correlates a request with its result and backs at-most-once
    /// execution for side-effecting tools.
    pub request_id: Uuid,
    /// base64 capability token. Absent on messages that carry no authority
    /// (ui.* notifications, observation results).
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub capability_token: Option<String>,
    pub context: PageBinding,
    /// Absolute deadline in epoch milliseconds; the receiver must give up
    /// and report `timed_out` past it.
    pub deadline_unix_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub body: T,
}

/// Messages the core emits toward the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeOutMsg {
    /// Ask the extraction layer for a fresh observation.
    ObserveRequest {
        /// Optional handle to scope the observation to one subtree, used by
        /// the post-mutation verification pass.
        #[serde(skip_serializing_if = "Option::is_none")]
        scope_handle: Option<String>,
    },

    /// Execute one typed tool call against the page.
    ToolRequest {
        tool: String,
        arguments: serde_json::Value,
    },

    /// The next action needs a real user gesture before it may run.
    UiGestureRequired { reason_code: String },

    /// Compact run snapshot for the UI to render.
    UiState { state: RunStatePayload },
}

/// Messages the core consumes from the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeInMsg {
    ObservationResult {
        observation: Observation,
    },

    ToolResult {
        /// `ok` or a stable error code (`stale_handle`, `timed_out`, ...).
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },

    /// The user performed the gesture a prior `ui.gesture_required` asked
    /// for.
    UiGesturePerformed,

    /// The user started interacting with the page themselves.
    UiTakeover,

    UiApproval {
        /// Submission id of the pending approval being resolved.
        approval_id: String,
        /// When true, identical proposals on this document are approved for
        /// the remainder of the run.
        #[serde(default)]
        for_session: bool,
    },

    UiDenial {
        approval_id: String,
    },

    UiCancel,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::binding::DocumentIdentity;
    use crate::binding::Mode;

    fn binding() -> PageBinding {
        PageBinding {
            origin: "https://example.com".to_string(),
            tab_id: 1,
            frame_id: 0,
            document: DocumentIdentity {
                document_id: "D1".to_string(),
                navigation_generation: 1,
            },
            mode: Mode::ReadOnly,
        }
    }

    #[test]
    fn tool_request_round_trips_with_type_tag() {
        let env = Envelope {
            protocol_version: PROTOCOL_VERSION,
            request_id: Uuid::new_v4(),
            capability_token: Some("dG9rZW4".to_string()),
            context: binding(),
            deadline_unix_ms: 1_700_000_000_000,
            idempotency_key: None,
            body: BridgeOutMsg::ToolRequest {
                tool: "browser.click".to_string(),
                arguments: serde_json::json!({ "handle": "h1" }),
            },
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["body"]["type"], "tool_request");
        let back: Envelope<BridgeOutMsg> = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn envelope_rejects_unknown_fields() {
        let mut json = serde_json::to_value(Envelope {
            protocol_version: PROTOCOL_VERSION,
            request_id: Uuid::new_v4(),
            capability_token: None,
            context: binding(),
            deadline_unix_ms: 0,
            idempotency_key: None,
            body: BridgeInMsg::UiCancel,
        })
        .unwrap();
        json["cookie"] = serde_json::Value::String("nope".to_string());
        assert!(serde_json::from_value::<Envelope<BridgeInMsg>>(json).is_err());
    }
}
