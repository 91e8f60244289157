use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Autonomy level for a run. Determines how liberally tool calls are
/// auto-approved by the policy gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Mode {
    /// The agent may observe and answer but never mutate the page.
    #[default]
    ReadOnly,

    /// Mutations are proposed one at a time and require approval unless the
    /// policy matrix says otherwise.
    Assist,

    /// Low-risk mutations run without a prompt; sensitive categories still
    /// ask or deny per the matrix.
    Autopilot,
}

impl Mode {
    /// One-step autonomy downgrade, used when a step exhausts its retry
    /// budget or an observation looks injected.
    pub fn downgraded(self) -> Mode {
        match self {
            Mode::Autopilot => Mode::Assist,
            Mode::Assist | Mode::ReadOnly => Mode::ReadOnly,
        }
    }
}

/// Where the run is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Surface {
    /// A workspace tab the agent owns end to end.
    #[default]
    Isolated,

    /// The user's own tab; stricter gating and explicit re-authorization
    /// after any disconnect.
    Connected,
}

/// Identity of a specific rendered document. The `navigation_generation`
/// counter is bumped by the extraction layer on every in-document navigation
/// (SPA route changes included) and invalidates all element handles minted
/// before the bump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentIdentity {
    pub document_id: String,
    pub navigation_generation: u64,
}

/// The full binding a capability token and a policy decision are scoped to.
///
/// Two bindings are interchangeable only when every field matches; any
/// difference is a `BindingMismatch` at verification time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageBinding {
    /// Scheme + host + port, normalized by the bridge.
    pub origin: String,
    pub tab_id: u64,
    pub frame_id: u64,
    pub document: DocumentIdentity,
    pub mode: Mode,
}

impl PageBinding {
    /// True when `other` refers to the same document at the same navigation
    /// generation. Used to decide whether handles from an older observation
    /// are still meaningful.
    pub fn same_document(&self, other: &PageBinding) -> bool {
        self.origin == other.origin
            && self.tab_id == other.tab_id
            && self.frame_id == other.frame_id
            && self.document == other.document
    }
}
