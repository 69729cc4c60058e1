//! Stream Router - registry of live connections
//!
//! Enforces the connection ceiling and one live connection per context,
//! gates every operation on a scope, and aggregates statistics. The
//! registry map is the only shared mutable state between connections.

use mcpstream_core::{Scope, StreamingConfig, StreamingContext};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::connection::{
    CloseReason, ConnectionHooks, ConnectionOptions, ConnectionStats, ErrorCallback, EventFilter,
    StreamConnection,
};
use super::sink::EventSink;
use crate::auth::{authorize, AuthError, CredentialResolver};
use crate::error::{CapacityError, Result, StreamError};
use mcpstream_core::config::{MAX_BATCH_SIZE, MIN_HEARTBEAT_INTERVAL};

/// Parameters for a new connection; unset fields use the configured defaults
#[derive(Clone, Default)]
pub struct ConnectionRequest {
    pub context_id: String,
    pub filter: Option<EventFilter>,
    pub batch_size: Option<usize>,
    pub batch_timeout: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
    pub on_error: Option<ErrorCallback>,
}

impl ConnectionRequest {
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("context_id", &self.context_id)
            .field("filter", &self.filter.is_some())
            .field("batch_size", &self.batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

/// Aggregate router statistics
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatistics {
    pub active_connections: usize,
    pub total_connections_created: u64,
    /// Sum of sent counters over live connections
    pub total_events_sent: u64,
    /// Events shed by backpressure, including closed connections
    pub total_events_dropped: u64,
    pub uptime_secs: u64,
    pub connections: Vec<ConnectionStats>,
}

type Registry = Arc<RwLock<HashMap<String, Arc<StreamConnection>>>>;

pub struct StreamRouter {
    config: StreamingConfig,
    resolver: Arc<dyn CredentialResolver>,
    connections: Registry,
    total_created: AtomicU64,
    retired_dropped: Arc<AtomicU64>,
    started_at: Instant,
}

impl StreamRouter {
    pub fn new(config: StreamingConfig, resolver: Arc<dyn CredentialResolver>) -> Self {
        Self {
            config,
            resolver,
            connections: Arc::new(RwLock::new(HashMap::new())),
            total_created: AtomicU64::new(0),
            retired_dropped: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<dyn CredentialResolver> {
        &self.resolver
    }

    /// Check a credential for one scope
    pub fn authorize(&self, credential: Option<&str>, scope: Scope) -> std::result::Result<(), AuthError> {
        authorize(self.resolver.as_ref(), credential, scope).map(|_| ())
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Open and register a connection delivering `context` to `sink`
    pub fn create_connection(
        &self,
        credential: Option<&str>,
        request: ConnectionRequest,
        context: Arc<StreamingContext>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<StreamConnection>> {
        let auth = authorize(self.resolver.as_ref(), credential, Scope::Read)?;
        let options = self.build_options(&request, &context)?;
        let context_id = request.context_id;

        let mut connections = self.connections.write();

        if let Some(existing) = connections.get(&context_id) {
            if existing.is_active() {
                warn!(
                    context_id = %context_id,
                    "[StreamRouter] Rejecting duplicate connection"
                );
                return Err(CapacityError::DuplicateContext { context_id }.into());
            }
        }

        let live = connections.values().filter(|c| c.is_active()).count();
        if live >= self.config.max_connections {
            warn!(
                max = self.config.max_connections,
                "[StreamRouter] Connection limit reached"
            );
            return Err(CapacityError::LimitReached {
                max: self.config.max_connections,
            }
            .into());
        }

        let hooks = ConnectionHooks {
            on_close: Some(self.deregister_hook()),
            on_error: request.on_error,
        };
        let connection = StreamConnection::open_with_hooks(context, sink, options, hooks);

        connections.insert(context_id.clone(), connection.clone());
        self.total_created.fetch_add(1, Ordering::Relaxed);

        info!(
            context_id = %context_id,
            connection_id = %connection.id(),
            user_id = %auth.user_id,
            active = connections.len(),
            "[StreamRouter] Connection registered"
        );

        Ok(connection)
    }

    fn build_options(
        &self,
        request: &ConnectionRequest,
        context: &StreamingContext,
    ) -> Result<ConnectionOptions> {
        if request.context_id.is_empty() {
            return Err(StreamError::InvalidRequest("context_id must not be empty".to_string()));
        }
        if request.context_id != context.id() {
            return Err(StreamError::InvalidRequest(format!(
                "context_id '{}' does not match context '{}'",
                request.context_id,
                context.id()
            )));
        }

        let mut options = ConnectionOptions::from_config(&self.config);
        options.filter = request.filter.clone();

        if let Some(batch_size) = request.batch_size {
            if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
                return Err(StreamError::InvalidRequest(format!(
                    "batch_size must be between 1 and {}",
                    MAX_BATCH_SIZE
                )));
            }
            options.batch_size = batch_size;
        }
        if let Some(batch_timeout) = request.batch_timeout {
            if batch_timeout.is_zero() {
                return Err(StreamError::InvalidRequest(
                    "batch_timeout must be greater than 0".to_string(),
                ));
            }
            options.batch_timeout = batch_timeout;
        }
        if let Some(heartbeat_interval) = request.heartbeat_interval {
            if heartbeat_interval < MIN_HEARTBEAT_INTERVAL {
                return Err(StreamError::InvalidRequest(format!(
                    "heartbeat_interval must be at least {}ms",
                    MIN_HEARTBEAT_INTERVAL.as_millis()
                )));
            }
            options.heartbeat_interval = heartbeat_interval;
        }

        Ok(options)
    }

    /// Close callback: drop the registry entry if it still points at this connection
    fn deregister_hook(&self) -> Box<dyn FnOnce(&StreamConnection) + Send> {
        let registry = Arc::downgrade(&self.connections);
        let retired_dropped = self.retired_dropped.clone();

        Box::new(move |connection: &StreamConnection| {
            retired_dropped.fetch_add(connection.dropped_events(), Ordering::Relaxed);

            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut connections = registry.write();
            let same = connections
                .get(connection.context_id())
                .is_some_and(|c| c.id() == connection.id());
            if same {
                connections.remove(connection.context_id());
                debug!(
                    context_id = %connection.context_id(),
                    connection_id = %connection.id(),
                    remaining = connections.len(),
                    "[StreamRouter] Connection deregistered"
                );
            }
        })
    }

    /// Close the live connection for `context_id`; returns false if there was none
    pub async fn close_connection(&self, credential: Option<&str>, context_id: &str) -> Result<bool> {
        authorize(self.resolver.as_ref(), credential, Scope::Write)?;

        let connection = self.connections.read().get(context_id).cloned();
        match connection {
            Some(connection) => {
                connection.close().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every connection (graceful shutdown)
    pub async fn close_all(&self) {
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        if connections.is_empty() {
            return;
        }

        info!(
            count = connections.len(),
            "[StreamRouter] Closing all connections"
        );
        futures::future::join_all(
            connections
                .iter()
                .map(|c| c.close_with(CloseReason::Shutdown)),
        )
        .await;
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Live connections
    pub fn active_connections(&self) -> Vec<Arc<StreamConnection>> {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    /// The live connection for a context, if any
    pub fn connection(&self, context_id: &str) -> Option<Arc<StreamConnection>> {
        self.connections
            .read()
            .get(context_id)
            .filter(|c| c.is_active())
            .cloned()
    }

    pub fn statistics(&self, credential: Option<&str>) -> Result<RouterStatistics> {
        authorize(self.resolver.as_ref(), credential, Scope::Admin)?;

        let connections = self.active_connections();
        let snapshots: Vec<ConnectionStats> = connections.iter().map(|c| c.stats()).collect();
        let live_dropped: u64 = snapshots.iter().map(|s| s.dropped_events).sum();

        Ok(RouterStatistics {
            active_connections: snapshots.len(),
            total_connections_created: self.total_created.load(Ordering::Relaxed),
            total_events_sent: snapshots.iter().map(|s| s.sent_events).sum(),
            total_events_dropped: live_dropped + self.retired_dropped.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
            connections: snapshots,
        })
    }
}

impl std::fmt::Debug for StreamRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRouter")
            .field("connections", &self.connections.read().len())
            .field("max_connections", &self.config.max_connections)
            .finish()
    }
}
