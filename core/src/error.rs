use serde::Deserialize;
use serde::Serialize;
use std::io;
use strum_macros::Display;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, CoreErr>;

/// Stable machine-readable code attached to every error the core produces.
///
/// The enumeration is closed: codes cross the bridge, appear in the event
/// log, and drive UI copy, so adding a variant is a protocol change. Messages
/// shown to users are derived locally from the code, never from page content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    SchemaViolation,
    PermissionRequired,
    PolicyDenied,
    PreconditionFailed,
    VerificationFailed,
    NotFound,
    StaleHandle,
    NotInteractable,
    BlockedByOverlay,
    TimedOut,
    Cancelled,
    Unavailable,
    Unsupported,
    RateLimited,
    BindingMismatch,
    ChainConflict,
    ChainIntegrity,
    ClassifierUncertain,
    Durability,
    Backpressure,
    UnknownTool,
    Expired,
    UnknownKey,
    ToolNotPermitted,
    Tampered,
    Internal,
}

/// Whether an operation that failed with this code may have mutated the page
/// anyway. Drives the no-silent-replay rules in the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SideEffectHint {
    /// The failure provably happened before any mutation was attempted.
    None,
    /// The mutation may or may not have landed; only re-observation can tell.
    Possible,
}

impl ErrorCode {
    /// True when retrying the same operation is sane *for idempotent tools*.
    /// Side-effecting tools never retry regardless of this flag.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::TimedOut
                | ErrorCode::NotInteractable
                | ErrorCode::BlockedByOverlay
                | ErrorCode::Durability
                | ErrorCode::RateLimited
        )
    }

    pub fn side_effect_hint(self) -> SideEffectHint {
        match self {
            // Rejected before dispatch ever reached the page.
            ErrorCode::SchemaViolation
            | ErrorCode::PermissionRequired
            | ErrorCode::PolicyDenied
            | ErrorCode::PreconditionFailed
            | ErrorCode::StaleHandle
            | ErrorCode::RateLimited
            | ErrorCode::BindingMismatch
            | ErrorCode::ChainConflict
            | ErrorCode::ChainIntegrity
            | ErrorCode::ClassifierUncertain
            | ErrorCode::Backpressure
            | ErrorCode::UnknownTool
            | ErrorCode::Expired
            | ErrorCode::UnknownKey
            | ErrorCode::ToolNotPermitted
            | ErrorCode::Tampered
            | ErrorCode::Unsupported => SideEffectHint::None,
            // The executor was already invoked when these surfaced.
            ErrorCode::VerificationFailed
            | ErrorCode::NotFound
            | ErrorCode::NotInteractable
            | ErrorCode::BlockedByOverlay
            | ErrorCode::TimedOut
            | ErrorCode::Cancelled
            | ErrorCode::Unavailable
            | ErrorCode::Durability
            | ErrorCode::Internal => SideEffectHint::Possible,
        }
    }

    /// UI copy for this code. Deliberately static: reason text must never be
    /// assembled from page-derived strings.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorCode::SchemaViolation => "The request did not match the expected format.",
            ErrorCode::PermissionRequired => "This step needs your permission to continue.",
            ErrorCode::PolicyDenied => "Policy does not allow this action on this site.",
            ErrorCode::PreconditionFailed => "The page is not in the expected state for this step.",
            ErrorCode::VerificationFailed => "The action ran but its result could not be verified.",
            ErrorCode::NotFound => "The target element could not be found.",
            ErrorCode::StaleHandle => "The page changed before the action could run.",
            ErrorCode::NotInteractable => "The target element cannot be interacted with right now.",
            ErrorCode::BlockedByOverlay => "An overlay is blocking the target element.",
            ErrorCode::TimedOut => "The step took too long and was stopped.",
            ErrorCode::Cancelled => "The step was cancelled.",
            ErrorCode::Unavailable => "The browser connection was lost; the run is paused.",
            ErrorCode::Unsupported => "This action is not supported.",
            ErrorCode::RateLimited => "Too many pending actions; the plan will be revised.",
            ErrorCode::BindingMismatch => "The action was bound to a different page state.",
            ErrorCode::ChainConflict => "The run log advanced concurrently; the step was dropped.",
            ErrorCode::ChainIntegrity => "The run log failed an integrity check.",
            ErrorCode::ClassifierUncertain => {
                "The target field could not be classified; approval is required."
            }
            ErrorCode::Durability => "The run log could not be written to disk.",
            ErrorCode::Backpressure => "The run log writer is overloaded.",
            ErrorCode::UnknownTool => "The proposed tool is not part of the tool surface.",
            ErrorCode::Expired => "The authorization for this step expired.",
            ErrorCode::UnknownKey => "The authorization for this step is no longer valid.",
            ErrorCode::ToolNotPermitted => "The authorization does not cover this tool.",
            ErrorCode::Tampered => "The authorization failed verification.",
            ErrorCode::Internal => "An internal error occurred.",
        }
    }
}

#[derive(Error, Debug)]
pub enum CoreErr {
    /// Appended event's parent is not the current tip of the run log.
    #[error("event appended out of order: parent is not the tip")]
    ChainConflict,

    /// Payload failed validation against its kind's schema.
    #[error("payload failed schema validation: {0}")]
    SchemaViolation(String),

    /// The bounded event-store writer queue is full; callers fail fast
    /// rather than queue unboundedly.
    #[error("event store writer queue is full")]
    Backpressure,

    /// Storage failed underneath the event store.
    #[error("durable storage failure: {0}")]
    Durability(String),

    /// Recomputed hashes stopped matching at `seq`. Fatal for the run.
    #[error("hash chain break at event seq {seq}")]
    ChainIntegrity { seq: u64 },

    #[error("deadline expired")]
    TimedOut,

    #[error("cancelled")]
    Cancelled,

    /// The extension bridge disconnected or refused the call. Treated
    /// exactly like a disconnect: pause, rotate tokens, never resume a
    /// mutating step silently.
    #[error("bridge unavailable")]
    Unavailable,

    #[error("rate limited: mutation queue for this frame is full")]
    RateLimited,

    #[error("capability token expired")]
    TokenExpired,

    #[error("capability token bound to a different page state")]
    BindingMismatch,

    #[error("capability token signed with an unknown key")]
    UnknownKey,

    #[error("capability token does not permit tool `{0}`")]
    ToolNotPermitted(String),

    #[error("capability token failed MAC verification")]
    Tampered,

    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("element handle not present in the current observation: {0}")]
    StaleHandle(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("postcondition failed: {0}")]
    VerificationFailed(String),

    #[error("permission required: {0}")]
    PermissionRequired(String),

    /// A stable tool error reported by the executor.
    #[error("tool failed: {0}")]
    Tool(ErrorCode),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl From<rusqlite::Error> for CoreErr {
    fn from(e: rusqlite::Error) -> Self {
        CoreErr::Durability(e.to_string())
    }
}

impl CoreErr {
    /// The stable code for this error. Everything that crosses a process
    /// boundary or lands in the event log goes through here.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreErr::ChainConflict => ErrorCode::ChainConflict,
            CoreErr::SchemaViolation(_) => ErrorCode::SchemaViolation,
            CoreErr::Backpressure => ErrorCode::Backpressure,
            CoreErr::Durability(_) | CoreErr::Io(_) => ErrorCode::Durability,
            CoreErr::ChainIntegrity { .. } => ErrorCode::ChainIntegrity,
            CoreErr::TimedOut => ErrorCode::TimedOut,
            CoreErr::Cancelled => ErrorCode::Cancelled,
            CoreErr::Unavailable => ErrorCode::Unavailable,
            CoreErr::RateLimited => ErrorCode::RateLimited,
            CoreErr::TokenExpired => ErrorCode::Expired,
            CoreErr::BindingMismatch => ErrorCode::BindingMismatch,
            CoreErr::UnknownKey => ErrorCode::UnknownKey,
            CoreErr::ToolNotPermitted(_) => ErrorCode::ToolNotPermitted,
            CoreErr::Tampered => ErrorCode::Tampered,
            CoreErr::UnknownTool(_) => ErrorCode::UnknownTool,
            CoreErr::StaleHandle(_) => ErrorCode::StaleHandle,
            CoreErr::PreconditionFailed(_) => ErrorCode::PreconditionFailed,
            CoreErr::VerificationFailed(_) => ErrorCode::VerificationFailed,
            CoreErr::PermissionRequired(_) => ErrorCode::PermissionRequired,
            CoreErr::Tool(code) => *code,
            CoreErr::Unsupported(_) => ErrorCode::Unsupported,
            CoreErr::Json(_) => ErrorCode::SchemaViolation,
            CoreErr::Internal(_) | CoreErr::TokioJoin(_) => ErrorCode::Internal,
        }
    }

    pub fn retryable(&self) -> bool {
        self.code().retryable()
    }
}
