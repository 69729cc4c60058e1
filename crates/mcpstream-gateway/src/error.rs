//! Error types for stream delivery

use mcpstream_core::ValidationError;
use thiserror::Error;

use crate::auth::AuthError;

/// Writing to an output channel failed
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("output channel is closed")]
    ChannelClosed,

    #[error("write failed: {0}")]
    Write(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The router cannot take another connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("maximum connections ({max}) reached")]
    LimitReached { max: usize },

    #[error("a live connection already exists for context '{context_id}'")]
    DuplicateContext { context_id: String },
}

/// Any failure surfaced by the stream router
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Authorization(#[from] AuthError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid connection request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
