//! The extension-bridge seam.
//!
//! The core never talks to the browser directly; it hands typed envelopes to
//! an implementation of [`Bridge`] and consumes typed results. A closed
//! channel is indistinguishable from cancellation on the remote side, so
//! implementations must surface disconnects as `Unavailable` — the
//! orchestrator then pauses the run and rotates tokens rather than guessing.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use webpilot_protocol::BridgeOutMsg;
use webpilot_protocol::Envelope;
use webpilot_protocol::Observation;
use webpilot_protocol::PROTOCOL_VERSION;
use webpilot_protocol::PageBinding;
use webpilot_protocol::RunStatePayload;

use crate::error::Result;

/// Build the stable envelope around an outbound message.
pub fn envelope(
    request_id: Uuid,
    capability_token: Option<String>,
    context: PageBinding,
    deadline_unix_ms: u64,
    idempotency_key: Option<String>,
    body: BridgeOutMsg,
) -> Envelope<BridgeOutMsg> {
    Envelope {
        protocol_version: PROTOCOL_VERSION,
        request_id,
        capability_token,
        context,
        deadline_unix_ms,
        idempotency_key,
        body,
    }
}

/// The executor contract the core consumes. Implemented over native
/// messaging in production and by a scripted mock in tests.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Request a fresh observation (`observe.request`).
    async fn observe(
        &self,
        envelope: Envelope<BridgeOutMsg>,
        cancel: CancellationToken,
    ) -> Result<Observation>;

    /// Execute one tool call (`tool.request`) and return its payload.
    /// Implementations map wire error codes onto [`crate::error::CoreErr::Tool`]
    /// and a channel close onto `Unavailable`.
    async fn execute(
        &self,
        envelope: Envelope<BridgeOutMsg>,
        cancel: CancellationToken,
    ) -> Result<Value>;

    /// Ask for a real user gesture and wait for `ui.gesture_performed`.
    async fn require_gesture(
        &self,
        envelope: Envelope<BridgeOutMsg>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Fire-and-forget `ui.state` snapshot for the front-end.
    async fn emit_ui_state(&self, state: RunStatePayload);
}
