//! Gateway Server
//!
//! HTTP surface for streaming contexts:
//! - Producers create contexts, publish events and upload artifacts
//! - Consumers attach one SSE connection per context
//! - Artifacts are served back through signed URLs

mod error;
mod handlers;
mod state;

pub use error::{ApiError, ErrorResponse};
pub use handlers::{StreamInfo, SubscribeQuery};
pub use state::{AppState, ContextRegistry};

use anyhow::Context as _;
use axum::{
    routing::{delete, get, post},
    Router,
};
use mcpstream_core::{EventValidator, SequenceManager, StreamingConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::artifacts::InMemoryArtifactStore;
use crate::auth::{AuthConfig, TokenAuthenticator};
use crate::logging::LogConfig;
use crate::stream::StreamRouter;

/// Default port the gateway listens on
pub const DEFAULT_PORT: u16 = 45900;

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Enable CORS for browser access
    pub enable_cors: bool,
    /// Public base URL used in signed artifact links
    pub base_url: Option<String>,
    pub auth: AuthConfig,
    pub log: LogConfig,
    pub streaming: StreamingConfig,
    /// HMAC key for artifact URLs; a random key is generated when absent
    pub artifact_signing_key: Option<Zeroizing<String>>,
    /// Records buffered per SSE response before the connection sees write failures
    pub sink_capacity: usize,
    /// Period of artifact cleanup and finished-context pruning
    pub maintenance_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            enable_cors: true,
            base_url: None,
            auth: AuthConfig::default(),
            log: LogConfig::default(),
            streaming: StreamingConfig::default(),
            artifact_signing_key: None,
            sink_capacity: 256,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

impl GatewayConfig {
    /// Load from `MCPSTREAM_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            streaming: StreamingConfig::from_lookup(&lookup),
            ..Default::default()
        };

        if let Some(host) = lookup("MCPSTREAM_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("MCPSTREAM_PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => warn!(value = %port, "[Config] Ignoring invalid MCPSTREAM_PORT"),
            }
        }
        if let Some(value) = lookup("MCPSTREAM_ENABLE_CORS") {
            config.enable_cors = parse_flag(&value);
        }
        config.base_url = lookup("MCPSTREAM_BASE_URL");

        config.auth.jwt_secret = lookup("MCPSTREAM_JWT_SECRET").map(Zeroizing::new);
        config.auth.issuer = lookup("MCPSTREAM_JWT_ISSUER");
        config.auth.audience = lookup("MCPSTREAM_JWT_AUDIENCE");
        if let Some(value) = lookup("MCPSTREAM_ALLOW_ANONYMOUS") {
            config.auth.allow_anonymous = parse_flag(&value);
        }

        if let Some(dir) = lookup("MCPSTREAM_LOG_DIR") {
            config.log.directory = if dir.is_empty() { None } else { Some(dir.into()) };
        }
        config.artifact_signing_key = lookup("MCPSTREAM_ARTIFACT_KEY").map(Zeroizing::new);

        config
    }

    /// Get the socket address
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid address {}:{}", self.host, self.port))
    }

    /// Get the base URL for this gateway
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn random_key() -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(Uuid::new_v4().as_bytes());
    key.extend_from_slice(Uuid::new_v4().as_bytes());
    key
}

/// Streaming gateway server
pub struct GatewayServer {
    config: GatewayConfig,
    state: AppState,
    shutdown: CancellationToken,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Self {
        info!("[Gateway] Initializing...");

        let authenticator = Arc::new(TokenAuthenticator::new(config.auth.clone()));
        let router = Arc::new(StreamRouter::new(config.streaming.clone(), authenticator));

        let validator = Arc::new(EventValidator::new(config.streaming.limits.clone()));
        let sequences = Arc::new(SequenceManager::new());
        let contexts = Arc::new(ContextRegistry::new(sequences, validator.clone()));

        let signing_key = match &config.artifact_signing_key {
            Some(key) => key.as_bytes().to_vec(),
            None => {
                debug!("[Gateway] No artifact signing key configured, generated one");
                random_key()
            }
        };
        let artifacts = Arc::new(InMemoryArtifactStore::new(
            config.base_url(),
            signing_key,
            config.streaming.limits.max_artifact_bytes,
        ));

        let state = AppState {
            router,
            contexts,
            artifacts,
            validator,
            sink_capacity: config.sink_capacity.max(1),
        };

        Self {
            config,
            state,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Get the shared handler state
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Token that stops a running server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Build the Axum router
    pub fn build_router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(handlers::health))
            .route("/streams", post(handlers::create_stream))
            .route("/streams/{id}", get(handlers::get_stream))
            .route(
                "/streams/{id}/events",
                post(handlers::publish_event).get(handlers::subscribe),
            )
            .route("/streams/{id}/artifacts", post(handlers::upload_artifact))
            .route("/streams/{id}/complete", post(handlers::complete_stream))
            .route("/streams/{id}/cancel", post(handlers::cancel_stream))
            .route("/streams/{id}/connection", delete(handlers::close_connection))
            .route("/stats", get(handlers::stats))
            .route("/artifacts/{id}", get(handlers::get_artifact))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        // Add CORS if enabled
        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router
    }

    /// Periodic artifact cleanup and pruning of finished contexts
    fn spawn_maintenance(&self) {
        let period = self.config.maintenance_interval;
        self.state
            .artifacts
            .clone()
            .spawn_cleanup(period, self.shutdown.clone());

        let contexts = self.state.contexts.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let pruned = contexts.prune_finished();
                        if pruned > 0 {
                            debug!(pruned = pruned, "[Gateway] Finished contexts pruned");
                        }
                    }
                }
            }
        });
    }

    /// Run the gateway server until Ctrl-C or the shutdown token fires
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.addr()?;

        info!("[Gateway] Starting on {}", addr);
        info!(
            "[Gateway] CORS: {}",
            if self.config.enable_cors {
                "enabled"
            } else {
                "disabled"
            }
        );
        if self.config.auth.jwt_secret.is_some() {
            info!("[Gateway] JWT validation: enabled");
        } else {
            warn!("[Gateway] JWT validation: disabled (no secret configured)");
        }
        if self.config.auth.allow_anonymous {
            warn!(
                scopes = ?self.config.auth.anonymous_scopes,
                "[Gateway] Anonymous access enabled"
            );
        }

        self.spawn_maintenance();

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        info!("[Gateway] Ready to accept connections");

        let shutdown = self.shutdown.clone();
        let stream_router = self.state.router.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!("[Gateway] Failed to listen for Ctrl-C: {}", e);
                            shutdown.cancelled().await;
                        }
                    }
                }
                info!("[Gateway] Shutting down");
                // Open SSE bodies only end once their connections close
                stream_router.close_all().await;
                shutdown.cancel();
            })
            .await?;

        info!("[Gateway] Stopped");
        Ok(())
    }

    /// Start the server in the background
    pub fn spawn(self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
