//! Domain types for mcpstream

mod auth;
mod event;

pub use auth::{AuthResult, Scope, WILDCARD_SCOPE};
pub use event::{
    is_artifact_event, is_signal_event, ArtifactEvent, ArtifactFields, EventFamily, SignalEvent,
    SignalPayload, StreamingEvent,
};
