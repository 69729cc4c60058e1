//! mcpstream Gateway
//!
//! Real-time event delivery for tool executions:
//! - Bounded, batched SSE delivery with backpressure
//! - Circuit breaking on persistent write failures
//! - One live connection per streaming context
//! - Bearer token authorization with read/write/admin scopes
//! - Artifact storage with signed retrieval URLs

pub mod artifacts;
pub mod auth;
pub mod error;
pub mod logging;
pub mod server;
pub mod stream;

pub use artifacts::InMemoryArtifactStore;
pub use auth::{AuthConfig, AuthError, BearerCredential, CredentialResolver, TokenAuthenticator};
pub use error::{CapacityError, StreamError, TransportError};
pub use logging::{init_tracing, LogConfig};
pub use server::{ApiError, AppState, GatewayConfig, GatewayServer};
pub use stream::{
    ChannelSink, CloseReason, ConnectionOptions, ConnectionRequest, ConnectionState, EventSink,
    RouterStatistics, StreamConnection, StreamRouter,
};
