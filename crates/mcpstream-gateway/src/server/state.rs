//! Shared gateway state

use dashmap::DashMap;
use mcpstream_core::{EventValidator, SequenceManager, StreamingContext};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::artifacts::InMemoryArtifactStore;
use crate::stream::StreamRouter;

/// Streaming contexts known to this gateway, keyed by id
pub struct ContextRegistry {
    contexts: DashMap<String, Arc<StreamingContext>>,
    sequences: Arc<SequenceManager>,
    validator: Arc<EventValidator>,
}

impl ContextRegistry {
    pub fn new(sequences: Arc<SequenceManager>, validator: Arc<EventValidator>) -> Self {
        Self {
            contexts: DashMap::new(),
            sequences,
            validator,
        }
    }

    /// Create a context; returns `None` if the id is taken
    pub fn create(&self, id: Option<String>) -> Option<Arc<StreamingContext>> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.contexts.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let context = Arc::new(StreamingContext::new(
                    entry.key().clone(),
                    self.sequences.clone(),
                    self.validator.clone(),
                ));
                entry.insert(context.clone());
                debug!(context_id = %context.id(), "[Contexts] Created");
                Some(context)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<StreamingContext>> {
        self.contexts.get(id).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Forget finished contexts nobody is listening to
    pub fn prune_finished(&self) -> usize {
        let mut pruned = Vec::new();
        self.contexts.retain(|id, context| {
            let keep = context.is_active() || context.listener_count() > 0;
            if !keep {
                pruned.push(id.clone());
            }
            keep
        });
        for id in &pruned {
            self.sequences.reset(id);
        }
        pruned.len()
    }
}

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<StreamRouter>,
    pub contexts: Arc<ContextRegistry>,
    pub artifacts: Arc<InMemoryArtifactStore>,
    pub validator: Arc<EventValidator>,
    /// Buffered records per SSE response
    pub sink_capacity: usize,
}

impl axum::extract::FromRef<AppState> for Arc<StreamRouter> {
    fn from_ref(state: &AppState) -> Self {
        state.router.clone()
    }
}
