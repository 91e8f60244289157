//! Types shared between the agent core, the extension bridge, and the UI.
//!
//! Everything in this crate crosses a process boundary as JSON, so the rules
//! are stricter than for ordinary internal types: tagged enums with
//! `snake_case` type tags, `deny_unknown_fields` on every message the core
//! ingests, and no payload may ever carry cookies, session tokens, capability
//! keys, raw markup, or typed form values.

mod binding;
mod envelope;
mod observation;
mod ui_state;

pub use binding::DocumentIdentity;
pub use binding::Mode;
pub use binding::PageBinding;
pub use binding::Surface;
pub use envelope::BridgeInMsg;
pub use envelope::BridgeOutMsg;
pub use envelope::Envelope;
pub use envelope::PROTOCOL_VERSION;
pub use observation::AccessSignal;
pub use observation::BoundingBox;
pub use observation::FormFieldMeta;
pub use observation::InteractiveElement;
pub use observation::Observation;
pub use observation::RedactionNote;
pub use observation::TextSegment;
pub use ui_state::RunControls;
pub use ui_state::RunStatePayload;
pub use ui_state::RunSummary;
