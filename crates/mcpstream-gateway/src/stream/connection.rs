//! Stream Connection - binds one streaming context to one output channel
//!
//! Each connection owns a driver task that:
//! - flushes queued events to the sink in order, in sub-batches with a
//!   cooperative yield between them
//! - runs the adaptive batch timer and the heartbeat timer
//! - reacts to context completion/cancellation
//! - trips the circuit breaker after repeated consecutive write failures
//!
//! Producers never wait on the sink: context listeners enqueue under a
//! short lock and wake the driver.
//!
//! ```text
//! StreamingContext ──publish──▶ on_event ──▶ DeliveryQueue ──▶ driver ──▶ EventSink
//!                  ──state────▶ on_state ───────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use mcpstream_core::{
    ContextState, DeliveryTuning, SignalPayload, StreamingConfig, StreamingContext,
    StreamingEvent, Subscription,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::queue::{DeliveryQueue, FlushPlan};
use super::sink::EventSink;
use crate::error::TransportError;

/// Caller-supplied predicate; events it rejects are not delivered
pub type EventFilter = Arc<dyn Fn(&StreamingEvent) -> bool + Send + Sync>;

/// Invoked on every failed write with the running failure count
pub type ErrorCallback = Arc<dyn Fn(&TransportError, u32) + Send + Sync>;

/// Invoked exactly once after the connection has closed
pub type CloseCallback = Box<dyn FnOnce(&StreamConnection) + Send>;

/// Code carried by in-band delivery failure reports
pub const TRANSPORT_ERROR_CODE: &str = "TRANSPORT_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    Closed,
}

/// Why a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `close()` was called (router, client request)
    Requested,
    /// The context completed
    Completed,
    /// The context was cancelled
    Cancelled,
    /// The receiving side went away
    ChannelClosed,
    /// Too many consecutive write failures
    CircuitOpen,
    /// Gateway shutdown
    Shutdown,
}

impl CloseReason {
    /// Whether queued events are still written before the channel ends
    fn flushes_on_close(&self) -> bool {
        !matches!(self, Self::ChannelClosed | Self::CircuitOpen)
    }
}

/// Per-connection delivery settings
#[derive(Clone)]
pub struct ConnectionOptions {
    pub filter: Option<EventFilter>,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub tuning: DeliveryTuning,
}

impl ConnectionOptions {
    /// Defaults taken from the streaming configuration
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            filter: None,
            batch_size: config.defaults.batch_size,
            batch_timeout: config.defaults.batch_timeout,
            heartbeat_interval: config.defaults.heartbeat_interval,
            tuning: config.delivery.clone(),
        }
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&StreamingConfig::default())
    }
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("filter", &self.filter.is_some())
            .field("batch_size", &self.batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("tuning", &self.tuning)
            .finish()
    }
}

/// Optional lifecycle callbacks
#[derive(Default)]
pub struct ConnectionHooks {
    pub on_close: Option<CloseCallback>,
    pub on_error: Option<ErrorCallback>,
}

/// Point-in-time view of a connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub id: Uuid,
    pub context_id: String,
    pub state: ConnectionState,
    pub sent_events: u64,
    pub dropped_events: u64,
    pub queued_events: usize,
    pub consecutive_failures: u32,
    pub backpressure: bool,
    pub created_at: DateTime<Utc>,
}

struct ConnectionInner {
    state: ConnectionState,
    queue: DeliveryQueue,
    consecutive_failures: u32,
    pending_state: Option<ContextState>,
    flush_requested: bool,
    flush_deadline: Option<Instant>,
    close_requested: Option<CloseReason>,
    close_reason: Option<CloseReason>,
    subscriptions: Vec<Subscription>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
}

impl ConnectionInner {
    fn apply_plan(&mut self, plan: Option<FlushPlan>) {
        match plan {
            Some(FlushPlan::Immediate) => self.flush_requested = true,
            Some(FlushPlan::After(delay)) => {
                let at = Instant::now() + delay;
                self.flush_deadline = Some(match self.flush_deadline {
                    Some(existing) if existing <= at => existing,
                    _ => at,
                });
            }
            None => {}
        }
    }
}

/// A live binding between a streaming context and an output channel
pub struct StreamConnection {
    id: Uuid,
    context: Arc<StreamingContext>,
    sink: Arc<dyn EventSink>,
    options: ConnectionOptions,
    created_at: DateTime<Utc>,
    sent: AtomicU64,
    inner: Mutex<ConnectionInner>,
    wake: Notify,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl StreamConnection {
    /// Open a connection and start its driver task
    pub fn open(
        context: Arc<StreamingContext>,
        sink: Arc<dyn EventSink>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        Self::open_with_hooks(context, sink, options, ConnectionHooks::default())
    }

    /// Open a connection with close/error callbacks
    pub fn open_with_hooks(
        context: Arc<StreamingContext>,
        sink: Arc<dyn EventSink>,
        options: ConnectionOptions,
        hooks: ConnectionHooks,
    ) -> Arc<Self> {
        let queue = DeliveryQueue::new(
            options.batch_size,
            options.batch_timeout,
            options.tuning.clone(),
        );

        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            context,
            sink,
            options,
            created_at: Utc::now(),
            sent: AtomicU64::new(0),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Active,
                queue,
                consecutive_failures: 0,
                pending_state: None,
                flush_requested: false,
                flush_deadline: None,
                close_requested: None,
                close_reason: None,
                subscriptions: Vec::new(),
                on_close: hooks.on_close,
                on_error: hooks.on_error,
            }),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
        });

        connection.subscribe();

        info!(
            connection_id = %connection.id,
            context_id = %connection.context.id(),
            batch_size = connection.options.batch_size,
            heartbeat_ms = connection.options.heartbeat_interval.as_millis() as u64,
            "[StreamConnection] Opened"
        );

        tokio::spawn(connection.clone().run());
        connection
    }

    fn subscribe(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let events = self.context.subscribe(Arc::new(move |event: &StreamingEvent| {
            if let Some(connection) = weak.upgrade() {
                connection.on_event(event);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        let states = self.context.on_state_change(Arc::new(move |state| {
            if let Some(connection) = weak.upgrade() {
                connection.on_context_state(state);
            }
        }));

        self.inner.lock().subscriptions = vec![events, states];

        // A context that ended before we subscribed gets the same reaction
        let state = self.context.state();
        if state.is_terminal() {
            self.on_context_state(state);
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context_id(&self) -> &str {
        self.context.id()
    }

    pub fn context(&self) -> &Arc<StreamingContext> {
        &self.context
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn sent_events(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn is_backpressure_engaged(&self) -> bool {
        self.inner.lock().queue.is_backpressure_engaged()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.inner.lock().queue.dropped()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.lock();
        ConnectionStats {
            id: self.id,
            context_id: self.context.id().to_string(),
            state: inner.state,
            sent_events: self.sent.load(Ordering::Relaxed),
            dropped_events: inner.queue.dropped(),
            queued_events: inner.queue.len(),
            consecutive_failures: inner.consecutive_failures,
            backpressure: inner.queue.is_backpressure_engaged(),
            created_at: self.created_at,
        }
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Ask the driver to close; does not wait
    ///
    /// Safe to call from callbacks running on the driver task.
    pub fn request_close(&self, reason: CloseReason) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.close_requested.get_or_insert(reason);
        }
        self.shutdown.cancel();
    }

    /// Close the connection and wait until it has fully closed
    ///
    /// Idempotent: later calls return once the first close has finished.
    pub async fn close(&self) {
        self.close_with(CloseReason::Requested).await;
    }

    pub async fn close_with(&self, reason: CloseReason) {
        self.request_close(reason);
        self.closed.cancelled().await;
    }

    /// Wait until the connection has closed for any reason
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    // ========================================================================
    // Inbound (producer side)
    // ========================================================================

    fn on_event(&self, event: &StreamingEvent) {
        if self.sink.is_closed() {
            return;
        }
        if let Some(filter) = &self.options.filter {
            if !filter(event) {
                return;
            }
        }
        self.enqueue(event.clone());
    }

    fn on_context_state(&self, state: ContextState) {
        if !state.is_terminal() {
            return;
        }
        self.inner.lock().pending_state.get_or_insert(state);
        self.wake.notify_one();
    }

    fn enqueue(&self, event: StreamingEvent) {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed || inner.close_requested.is_some() {
                return;
            }
            let outcome = inner.queue.push(event);
            let plan = inner.queue.plan();
            inner.apply_plan(plan);
            outcome
        };

        if outcome.engaged {
            warn!(
                connection_id = %self.id,
                context_id = %self.context.id(),
                dropped = outcome.dropped,
                "[StreamConnection] Backpressure engaged, shedding oldest events"
            );
        } else if outcome.dropped > 0 {
            debug!(
                connection_id = %self.id,
                dropped = outcome.dropped,
                "[StreamConnection] Shed events under backpressure"
            );
        }

        self.wake.notify_one();
    }

    /// Build a connection-local signal; these carry no sequence number
    fn local_signal(&self, payload: SignalPayload) -> Option<StreamingEvent> {
        match self.context.validator().create_signal_event(payload, None) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(
                    connection_id = %self.id,
                    error = %e,
                    "[StreamConnection] Failed to build local signal"
                );
                None
            }
        }
    }

    // ========================================================================
    // Driver
    // ========================================================================

    async fn run(self: Arc<Self>) {
        let period = self.options.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let (pending_state, flush_now, deadline) = {
                let mut inner = self.inner.lock();
                (
                    inner.pending_state.take(),
                    std::mem::take(&mut inner.flush_requested),
                    inner.flush_deadline,
                )
            };

            if let Some(state) = pending_state {
                break self.react_to_state(state);
            }

            if flush_now {
                if let Err(reason) = self.flush().await {
                    break reason;
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    let requested = self.inner.lock().close_requested;
                    break requested.unwrap_or(CloseReason::Requested);
                }
                _ = self.sink.closed() => {
                    break CloseReason::ChannelClosed;
                }
                _ = self.wake.notified() => {}
                _ = sleep_until_opt(deadline) => {
                    let mut inner = self.inner.lock();
                    inner.flush_deadline = None;
                    inner.flush_requested = true;
                }
                _ = heartbeat.tick() => {
                    if let Some(event) = self.local_signal(SignalPayload::Heartbeat {}) {
                        self.enqueue(event);
                    }
                }
            }
        };

        self.finish(reason).await;
    }

    fn react_to_state(&self, state: ContextState) -> CloseReason {
        let (payload, reason) = match state {
            ContextState::Cancelled => (
                SignalPayload::Cancel {
                    reason: self.context.cancel_reason(),
                },
                CloseReason::Cancelled,
            ),
            _ => (
                SignalPayload::status("completed", None),
                CloseReason::Completed,
            ),
        };

        debug!(
            connection_id = %self.id,
            context_id = %self.context.id(),
            state = state.as_str(),
            "[StreamConnection] Context ended"
        );

        if let Some(event) = self.local_signal(payload) {
            self.enqueue(event);
        }
        reason
    }

    /// Write everything queued at the start of the flush
    async fn flush(&self) -> Result<(), CloseReason> {
        let mut remaining = {
            let mut inner = self.inner.lock();
            inner.flush_requested = false;
            inner.flush_deadline = None;
            inner.queue.begin_flush()
        };

        let chunk_size = self.options.tuning.flush_chunk_size.max(1);
        let result = loop {
            if remaining == 0 {
                break Ok(());
            }

            let (chunk, recovered) = self.inner.lock().queue.take_chunk(chunk_size.min(remaining));
            if chunk.is_empty() {
                break Ok(());
            }
            remaining -= chunk.len();

            if recovered {
                info!(
                    connection_id = %self.id,
                    context_id = %self.context.id(),
                    "[StreamConnection] Backpressure released"
                );
            }

            if let Err(reason) = self.deliver_all(&chunk).await {
                break Err(reason);
            }

            tokio::task::yield_now().await;
        };

        let mut inner = self.inner.lock();
        inner.queue.end_flush();
        let plan = inner.queue.plan();
        inner.apply_plan(plan);
        result
    }

    async fn deliver_all(&self, events: &[StreamingEvent]) -> Result<(), CloseReason> {
        for event in events {
            self.deliver(event).await?;
        }
        Ok(())
    }

    async fn deliver(&self, event: &StreamingEvent) -> Result<(), CloseReason> {
        match self.write_event(event).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                self.inner.lock().consecutive_failures = 0;
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                let failures = self.record_failure(err)?;
                self.report_failure(&message, failures).await
            }
        }
    }

    async fn write_event(&self, event: &StreamingEvent) -> Result<(), TransportError> {
        let payload = serde_json::to_string(event)?;
        self.sink.write(&payload, Some(event.family().as_str())).await
    }

    /// Count a failed write; `Err` means the connection must close now
    fn record_failure(&self, err: TransportError) -> Result<u32, CloseReason> {
        let (failures, on_error) = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures += 1;
            (inner.consecutive_failures, inner.on_error.clone())
        };

        warn!(
            connection_id = %self.id,
            context_id = %self.context.id(),
            failures = failures,
            error = %err,
            "[StreamConnection] Write failed"
        );

        if let Some(on_error) = on_error {
            on_error(&err, failures);
        }

        if matches!(err, TransportError::ChannelClosed) {
            return Err(CloseReason::ChannelClosed);
        }

        if failures >= self.options.tuning.failure_threshold {
            warn!(
                connection_id = %self.id,
                context_id = %self.context.id(),
                failures = failures,
                "[StreamConnection] Circuit breaker tripped, closing"
            );
            return Err(CloseReason::CircuitOpen);
        }
        Ok(failures)
    }

    /// Tell the client about a write failure before the next event goes out
    ///
    /// A delivered report earns back `recovery_credit` failures; a report
    /// that cannot be written closes the connection.
    async fn report_failure(&self, message: &str, failure_count: u32) -> Result<(), CloseReason> {
        if self.inner.lock().close_requested.is_some() {
            return Ok(());
        }

        let payload = SignalPayload::Error {
            message: format!("Stream delivery failed: {}", message),
            code: Some(TRANSPORT_ERROR_CODE.to_string()),
            recoverable: true,
            failure_count: Some(failure_count),
        };
        let Some(event) = self.local_signal(payload) else {
            return Ok(());
        };

        match self.write_event(&event).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                let mut inner = self.inner.lock();
                inner.consecutive_failures = inner
                    .consecutive_failures
                    .saturating_sub(self.options.tuning.recovery_credit);
                Ok(())
            }
            Err(e) => {
                warn!(
                    connection_id = %self.id,
                    error = %e,
                    "[StreamConnection] Failure report could not be delivered, closing"
                );
                Err(CloseReason::CircuitOpen)
            }
        }
    }

    async fn finish(&self, reason: CloseReason) {
        if reason.flushes_on_close() {
            let events = self.inner.lock().queue.drain_all();
            let chunk_size = self.options.tuning.flush_chunk_size.max(1);
            for chunk in events.chunks(chunk_size) {
                if self.deliver_all(chunk).await.is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }

        let (subscriptions, on_close) = {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Closed;
            inner.close_reason = Some(reason);
            inner.flush_deadline = None;
            (
                std::mem::take(&mut inner.subscriptions),
                inner.on_close.take(),
            )
        };
        drop(subscriptions);

        self.sink.end().await;

        info!(
            connection_id = %self.id,
            context_id = %self.context.id(),
            reason = ?reason,
            sent = self.sent_events(),
            "[StreamConnection] Closed"
        );

        if let Some(on_close) = on_close {
            on_close(self);
        }
        self.shutdown.cancel();
        self.closed.cancel();
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.id)
            .field("context_id", &self.context.id())
            .field("state", &self.state())
            .finish()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
