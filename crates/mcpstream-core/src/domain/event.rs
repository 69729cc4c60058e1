//! Streaming Events - the two event families carried on an output stream
//!
//! Every record written to a client is a [`StreamingEvent`]:
//! - **Signal events**: small structured progress/status/result messages
//! - **Artifact events**: references to large binary objects stored out-of-band
//!
//! # Serialization
//!
//! Events serialize with a `family` field, and signal events add a `type`
//! field containing the snake_case variant name:
//! ```json
//! { "family": "signal", "type": "progress", "pct": 42.0, "seq": 3, "timestamp": "..." }
//! { "family": "artifact", "id": "...", "uri": "https://...", "mime_type": "image/png", ... }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// EVENT FAMILY
// ============================================================================

/// Event family, used as the `event:` tag on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    Signal,
    Artifact,
}

impl EventFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Artifact => "artifact",
        }
    }
}

// ============================================================================
// SIGNAL EVENTS
// ============================================================================

/// Variant-specific payload of a signal event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Progress of a running tool, in percent
    Progress {
        pct: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },

    /// Intermediate result produced before the tool finishes
    PartialResult {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },

    /// One leg of a route, as `[lon, lat]` pairs
    RouteSegment {
        segment_index: u32,
        coordinates: Vec<[f64; 2]>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance_m: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_s: Option<f64>,
    },

    /// A batch of points of interest from a search
    PoiBatch {
        batch_index: u32,
        pois: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_batches: Option<u32>,
    },

    /// Final tool result; the stream normally completes after this
    FinalResult {
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },

    /// Error report, either from a tool or from the delivery layer itself
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default)]
        recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_count: Option<u32>,
    },

    /// Lifecycle status (e.g. "started", "completed")
    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Free-form key/value metadata
    Metadata { data: Map<String, Value> },

    /// The stream was cancelled
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Keep-alive emitted by the connection
    Heartbeat {},
}

impl SignalPayload {
    /// Get the variant name as a string (matches the serialized `type`)
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::PartialResult { .. } => "partial_result",
            Self::RouteSegment { .. } => "route_segment",
            Self::PoiBatch { .. } => "poi_batch",
            Self::FinalResult { .. } => "final_result",
            Self::Error { .. } => "error",
            Self::Status { .. } => "status",
            Self::Metadata { .. } => "metadata",
            Self::Cancel { .. } => "cancel",
            Self::Heartbeat {} => "heartbeat",
        }
    }

    /// Shorthand for a progress payload
    pub fn progress(pct: f64, message: Option<String>) -> Self {
        Self::Progress {
            pct,
            message,
            stage: None,
        }
    }

    /// Shorthand for a status payload
    pub fn status(status: impl Into<String>, message: Option<String>) -> Self {
        Self::Status {
            status: status.into(),
            message,
        }
    }

    /// Shorthand for a non-recoverable error payload
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
            recoverable: false,
            failure_count: None,
        }
    }
}

/// A signal event: payload plus sequencing metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    #[serde(flatten)]
    pub payload: SignalPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// ARTIFACT EVENTS
// ============================================================================

/// Reference to a binary object held by an artifact store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEvent {
    pub id: String,
    pub uri: String,
    pub mime_type: String,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Unvalidated input for building an [`ArtifactEvent`]
///
/// `bytes` is signed so that bad producer input can be rejected with a
/// descriptive error instead of failing at deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactFields {
    pub id: String,
    pub uri: String,
    pub mime_type: String,
    pub bytes: i64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub seq: Option<u64>,
    /// Creation time; defaults to now
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

// ============================================================================
// STREAMING EVENT
// ============================================================================

/// Any event deliverable on a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum StreamingEvent {
    Signal(SignalEvent),
    Artifact(ArtifactEvent),
}

impl StreamingEvent {
    pub fn family(&self) -> EventFamily {
        match self {
            Self::Signal(_) => EventFamily::Signal,
            Self::Artifact(_) => EventFamily::Artifact,
        }
    }

    /// Narrow to a signal event
    pub fn as_signal(&self) -> Option<&SignalEvent> {
        match self {
            Self::Signal(signal) => Some(signal),
            Self::Artifact(_) => None,
        }
    }

    /// Narrow to an artifact event
    pub fn as_artifact(&self) -> Option<&ArtifactEvent> {
        match self {
            Self::Artifact(artifact) => Some(artifact),
            Self::Signal(_) => None,
        }
    }

    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Signal(signal) => signal.seq,
            Self::Artifact(artifact) => artifact.seq,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Signal(signal) => signal.timestamp,
            Self::Artifact(artifact) => artifact.timestamp,
        }
    }

    /// Short name for logging: the signal type or "artifact"
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Signal(signal) => signal.payload.type_name(),
            Self::Artifact(_) => "artifact",
        }
    }

    /// Error and cancel events survive backpressure shedding
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            Self::Signal(SignalEvent {
                payload: SignalPayload::Error { .. } | SignalPayload::Cancel { .. },
                ..
            })
        )
    }
}

/// True if the event is a signal event
pub fn is_signal_event(event: &StreamingEvent) -> bool {
    matches!(event, StreamingEvent::Signal(_))
}

/// True if the event is an artifact event
pub fn is_artifact_event(event: &StreamingEvent) -> bool {
    matches!(event, StreamingEvent::Artifact(_))
}
