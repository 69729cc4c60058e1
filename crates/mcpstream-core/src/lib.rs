//! # mcpstream Core Library
//!
//! Event model and publish-side primitives for mcpstream.
//!
//! ## Modules
//!
//! - `domain` - Streaming events and caller identity
//! - `validation` - Event construction and limit checks
//! - `sequence` - Per-context sequence numbers
//! - `context` - Streaming contexts (publish point, lifecycle)
//! - `artifact` - Artifact store contract
//! - `config` - Limits and delivery tuning

pub mod artifact;
pub mod config;
pub mod context;
pub mod domain;
pub mod sequence;
pub mod validation;

// Re-export commonly used types
pub use artifact::{ArtifactError, ArtifactMetadata, ArtifactStore, SignedUrl, StoredArtifact};
pub use config::{ConnectionDefaults, DeliveryTuning, StreamingConfig, ValidationLimits};
pub use context::{
    ContextState, EventListener, PublishError, StateListener, StreamingContext, Subscription,
};
pub use domain::*;
pub use sequence::{ContextSequence, SequenceManager, SequenceSource};
pub use validation::{EventValidator, ValidationError};
