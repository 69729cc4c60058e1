//! Streaming Context - the per-request publish point
//!
//! Producers (tool executions) push events into a context; stream
//! connections subscribe to it. A context moves from `Active` to exactly
//! one terminal state (`Completed` or `Cancelled`) and notifies state
//! listeners once when it does.
//!
//! Publishing is serialized per context, so listeners observe events in
//! sequence order. Listeners run outside the listener-table lock and may
//! subscribe, unsubscribe or publish again from the same thread. A publish
//! made from inside a listener is queued and dispatched once every listener
//! has seen the current event.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, trace};

use crate::domain::{ArtifactFields, SignalPayload, StreamingEvent};
use crate::sequence::{ContextSequence, SequenceManager, SequenceSource};
use crate::validation::{EventValidator, ValidationError};

/// Callback invoked for every published event
pub type EventListener = Arc<dyn Fn(&StreamingEvent) + Send + Sync>;

/// Callback invoked once when the context reaches a terminal state
pub type StateListener = Arc<dyn Fn(ContextState) + Send + Sync>;

/// Lifecycle of a streaming context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Active,
    Completed,
    Cancelled,
}

impl ContextState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Publishing into a context failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("context is {} and no longer accepts events", .state.as_str())]
    Inactive { state: ContextState },
}

#[derive(Clone, Copy)]
enum ListenerKind {
    Event,
    State,
}

struct ContextInner {
    state: ContextState,
    cancel_reason: Option<String>,
    next_listener_id: u64,
    event_listeners: BTreeMap<u64, EventListener>,
    state_listeners: BTreeMap<u64, StateListener>,
}

impl ContextInner {
    fn remove(&mut self, kind: ListenerKind, id: u64) {
        match kind {
            ListenerKind::Event => {
                self.event_listeners.remove(&id);
            }
            ListenerKind::State => {
                self.state_listeners.remove(&id);
            }
        }
    }
}

/// Handle to a registered listener; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    inner: Weak<Mutex<ContextInner>>,
    kind: ListenerKind,
    id: u64,
}

impl Subscription {
    /// Remove the listener now
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().remove(self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Events published while listeners are running
#[derive(Default)]
struct DispatchQueue {
    dispatching: bool,
    pending: VecDeque<StreamingEvent>,
}

/// Ends a dispatch round even if a listener panics
struct DispatchReset<'a>(&'a RefCell<DispatchQueue>);

impl Drop for DispatchReset<'_> {
    fn drop(&mut self) {
        let mut queue = self.0.borrow_mut();
        queue.dispatching = false;
        queue.pending.clear();
    }
}

/// Per-request publish point for streaming events
pub struct StreamingContext {
    id: String,
    sequence: ContextSequence,
    validator: Arc<EventValidator>,
    created_at: DateTime<Utc>,
    /// Serializes sequence assignment with listener dispatch
    publish_lock: ReentrantMutex<RefCell<DispatchQueue>>,
    inner: Arc<Mutex<ContextInner>>,
}

impl StreamingContext {
    pub fn new(
        id: impl Into<String>,
        sequences: Arc<SequenceManager>,
        validator: Arc<EventValidator>,
    ) -> Self {
        let id = id.into();
        Self {
            sequence: ContextSequence::new(sequences, id.clone()),
            id,
            validator,
            created_at: Utc::now(),
            publish_lock: ReentrantMutex::new(RefCell::new(DispatchQueue::default())),
            inner: Arc::new(Mutex::new(ContextInner {
                state: ContextState::Active,
                cancel_reason: None,
                next_listener_id: 0,
                event_listeners: BTreeMap::new(),
                state_listeners: BTreeMap::new(),
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == ContextState::Active
    }

    /// Reason passed to [`cancel`](Self::cancel), if any
    pub fn cancel_reason(&self) -> Option<String> {
        self.inner.lock().cancel_reason.clone()
    }

    /// Last sequence number handed out by this context
    pub fn current_sequence(&self) -> u64 {
        self.sequence.current()
    }

    pub fn validator(&self) -> &EventValidator {
        &self.validator
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().event_listeners.len()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Register a listener for published events
    pub fn subscribe(&self, listener: EventListener) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.event_listeners.insert(id, listener);
        Subscription {
            inner: Arc::downgrade(&self.inner),
            kind: ListenerKind::Event,
            id,
        }
    }

    /// Register a listener for the terminal state transition
    pub fn on_state_change(&self, listener: StateListener) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.state_listeners.insert(id, listener);
        Subscription {
            inner: Arc::downgrade(&self.inner),
            kind: ListenerKind::State,
            id,
        }
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Deliver an already-built event to every listener
    ///
    /// The event is delivered as-is (no sequence number is stamped).
    pub fn publish(&self, event: StreamingEvent) -> Result<(), PublishError> {
        let _guard = self.publish_lock.lock();
        self.dispatch(&event)
    }

    /// Validate a signal payload, stamp the next sequence number and publish it
    pub fn emit_signal(&self, payload: SignalPayload) -> Result<StreamingEvent, PublishError> {
        let _guard = self.publish_lock.lock();
        self.ensure_active()?;

        let event = self.validator.create_signal_event(payload, None)?;
        self.stamp_and_dispatch(event)
    }

    /// Validate artifact fields, stamp the next sequence number and publish it
    pub fn emit_artifact(&self, fields: ArtifactFields) -> Result<StreamingEvent, PublishError> {
        let _guard = self.publish_lock.lock();
        self.ensure_active()?;

        let event = self.validator.create_artifact_event(fields)?;
        self.stamp_and_dispatch(event)
    }

    fn ensure_active(&self) -> Result<(), PublishError> {
        match self.state() {
            ContextState::Active => Ok(()),
            state => Err(PublishError::Inactive { state }),
        }
    }

    fn stamp_and_dispatch(&self, mut event: StreamingEvent) -> Result<StreamingEvent, PublishError> {
        let seq = self.sequence.next_sequence();
        match &mut event {
            StreamingEvent::Signal(signal) => signal.seq = Some(seq),
            StreamingEvent::Artifact(artifact) => artifact.seq = Some(seq),
        }
        self.dispatch(&event)?;
        Ok(event)
    }

    fn dispatch(&self, event: &StreamingEvent) -> Result<(), PublishError> {
        let guard = self.publish_lock.lock();
        {
            let state = self.inner.lock().state;
            if state != ContextState::Active {
                return Err(PublishError::Inactive { state });
            }
        }

        let queue: &RefCell<DispatchQueue> = &guard;
        {
            let mut queue = queue.borrow_mut();
            if queue.dispatching {
                // Published from a listener; the outer loop delivers it
                queue.pending.push_back(event.clone());
                return Ok(());
            }
            queue.dispatching = true;
        }
        let _reset = DispatchReset(queue);

        self.notify_listeners(event);
        loop {
            let next = queue.borrow_mut().pending.pop_front();
            match next {
                Some(event) => self.notify_listeners(&event),
                None => break,
            }
        }
        Ok(())
    }

    fn notify_listeners(&self, event: &StreamingEvent) {
        let listeners: Vec<EventListener> =
            self.inner.lock().event_listeners.values().cloned().collect();

        trace!(
            context_id = %self.id,
            event_type = event.type_name(),
            seq = ?event.seq(),
            listeners = listeners.len(),
            "[StreamingContext] Publishing event"
        );

        for listener in listeners {
            listener(event);
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Mark the context completed; returns false if it was already terminal
    pub fn complete(&self) -> bool {
        self.transition(ContextState::Completed, None)
    }

    /// Cancel the context; returns false if it was already terminal
    pub fn cancel(&self, reason: Option<String>) -> bool {
        self.transition(ContextState::Cancelled, reason)
    }

    fn transition(&self, next: ContextState, reason: Option<String>) -> bool {
        let _guard = self.publish_lock.lock();

        let listeners: Vec<StateListener> = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = next;
            inner.cancel_reason = reason;
            inner.state_listeners.values().cloned().collect()
        };

        debug!(
            context_id = %self.id,
            state = next.as_str(),
            "[StreamingContext] State changed"
        );

        for listener in listeners {
            listener(next);
        }
        true
    }
}

impl SequenceSource for StreamingContext {
    fn next_sequence(&self) -> u64 {
        self.sequence.next_sequence()
    }
}

impl std::fmt::Debug for StreamingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
