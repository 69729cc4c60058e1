//! Per-context sequence numbers
//!
//! Sequence numbers start at 1 and increase by one for every event
//! accepted into a context. Counters are independent per context id.

use dashmap::DashMap;
use std::sync::Arc;

/// Anything that hands out the next sequence number for one context
pub trait SequenceSource: Send + Sync {
    fn next_sequence(&self) -> u64;
}

/// Monotonic counters keyed by context id
#[derive(Debug, Default)]
pub struct SequenceManager {
    counters: DashMap<String, u64>,
}

impl SequenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the counter for `context_id` (first call returns 1)
    pub fn next(&self, context_id: &str) -> u64 {
        let mut entry = self.counters.entry(context_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Last number handed out, 0 if none
    pub fn current(&self, context_id: &str) -> u64 {
        self.counters.get(context_id).map(|v| *v).unwrap_or(0)
    }

    /// Forget the counter; the next call to `next` returns 1 again
    pub fn reset(&self, context_id: &str) {
        self.counters.remove(context_id);
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// A [`SequenceManager`] bound to a single context id
#[derive(Debug, Clone)]
pub struct ContextSequence {
    manager: Arc<SequenceManager>,
    context_id: String,
}

impl ContextSequence {
    pub fn new(manager: Arc<SequenceManager>, context_id: impl Into<String>) -> Self {
        Self {
            manager,
            context_id: context_id.into(),
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn current(&self) -> u64 {
        self.manager.current(&self.context_id)
    }
}

impl SequenceSource for ContextSequence {
    fn next_sequence(&self) -> u64 {
        self.manager.next(&self.context_id)
    }
}
