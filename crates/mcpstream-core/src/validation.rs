//! Event construction and validation
//!
//! `EventValidator` builds events from producer input and checks them
//! against an injected [`ValidationLimits`]. Construction and validation
//! happen in one step, so an event that exists has passed every check:
//! - variant field constraints (pct range, non-empty messages, ...)
//! - artifact URI, MIME allow-list and size
//! - per-string and per-array ceilings over the whole JSON tree
//! - serialized size ceiling

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::ValidationLimits;
use crate::domain::{ArtifactEvent, ArtifactFields, SignalEvent, SignalPayload, StreamingEvent};
use crate::sequence::SequenceSource;

/// An event failed a construction constraint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Offending field or JSON path
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Builds and validates streaming events
#[derive(Debug, Clone, Default)]
pub struct EventValidator {
    limits: ValidationLimits,
}

impl EventValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Build a signal event, taking the next sequence number from `sequence` if given
    pub fn create_signal_event(
        &self,
        payload: SignalPayload,
        sequence: Option<&dyn SequenceSource>,
    ) -> Result<StreamingEvent, ValidationError> {
        self.create_signal_event_at(payload, sequence, None)
    }

    /// Like [`create_signal_event`](Self::create_signal_event) with an
    /// explicit creation time, falling back to now
    pub fn create_signal_event_at(
        &self,
        payload: SignalPayload,
        sequence: Option<&dyn SequenceSource>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<StreamingEvent, ValidationError> {
        // Reject before consuming a sequence number
        self.check_signal_payload(&payload)?;

        let event = StreamingEvent::Signal(SignalEvent {
            payload,
            seq: sequence.map(|source| source.next_sequence()),
            timestamp: timestamp.unwrap_or_else(Utc::now),
        });
        self.check_tree(&event)?;
        Ok(event)
    }

    /// Build an artifact event from unvalidated fields
    pub fn create_artifact_event(
        &self,
        fields: ArtifactFields,
    ) -> Result<StreamingEvent, ValidationError> {
        if fields.bytes <= 0 {
            return Err(ValidationError::new("bytes", "bytes must be a positive number"));
        }

        let event = StreamingEvent::Artifact(ArtifactEvent {
            id: fields.id,
            uri: fields.uri,
            mime_type: fields.mime_type,
            bytes: fields.bytes as u64,
            hash: fields.hash,
            expires_at: fields.expires_at,
            metadata: fields.metadata,
            seq: fields.seq,
            timestamp: fields.timestamp.unwrap_or_else(Utc::now),
        });
        self.validate(&event)?;
        Ok(event)
    }

    /// Re-check an existing event against every constraint
    pub fn validate(&self, event: &StreamingEvent) -> Result<(), ValidationError> {
        match event {
            StreamingEvent::Signal(signal) => self.check_signal_payload(&signal.payload)?,
            StreamingEvent::Artifact(artifact) => self.check_artifact(artifact)?,
        }
        self.check_tree(event)
    }

    /// Check whether a MIME type is on the allow-list (exact or `type/*`)
    pub fn is_mime_type_allowed(&self, mime_type: &str) -> bool {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        if mime_type.is_empty() {
            return false;
        }

        self.limits.allowed_mime_types.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            if allowed.contains('*') {
                glob::Pattern::new(&allowed)
                    .map(|pattern| pattern.matches(&mime_type))
                    .unwrap_or(false)
            } else {
                allowed == mime_type
            }
        })
    }

    // ========================================================================
    // Field checks
    // ========================================================================

    fn check_signal_payload(&self, payload: &SignalPayload) -> Result<(), ValidationError> {
        match payload {
            SignalPayload::Progress { pct, .. } => {
                if !pct.is_finite() || !(0.0..=100.0).contains(pct) {
                    return Err(ValidationError::new(
                        "pct",
                        "pct must be a number between 0 and 100",
                    ));
                }
            }
            SignalPayload::PartialResult { data, .. } => {
                if data.is_null() {
                    return Err(ValidationError::new("data", "data must not be null"));
                }
            }
            SignalPayload::RouteSegment { coordinates, .. } => {
                if coordinates.is_empty() {
                    return Err(ValidationError::new(
                        "coordinates",
                        "coordinates must be a non-empty array",
                    ));
                }
                let in_range = coordinates.iter().all(|[lon, lat]| {
                    lon.is_finite()
                        && lat.is_finite()
                        && (-180.0..=180.0).contains(lon)
                        && (-90.0..=90.0).contains(lat)
                });
                if !in_range {
                    return Err(ValidationError::new(
                        "coordinates",
                        "coordinates must be [lon, lat] pairs within range",
                    ));
                }
            }
            SignalPayload::PoiBatch { pois, .. } => {
                if pois.is_empty() {
                    return Err(ValidationError::new("pois", "pois must be a non-empty array"));
                }
                if !pois.iter().all(Value::is_object) {
                    return Err(ValidationError::new("pois", "pois must contain only objects"));
                }
            }
            SignalPayload::Error { message, .. } => {
                if message.trim().is_empty() {
                    return Err(ValidationError::new(
                        "message",
                        "message must be a non-empty string",
                    ));
                }
            }
            SignalPayload::Status { status, .. } => {
                if status.trim().is_empty() {
                    return Err(ValidationError::new(
                        "status",
                        "status must be a non-empty string",
                    ));
                }
            }
            SignalPayload::FinalResult { .. }
            | SignalPayload::Metadata { .. }
            | SignalPayload::Cancel { .. }
            | SignalPayload::Heartbeat {} => {}
        }
        Ok(())
    }

    fn check_artifact(&self, artifact: &ArtifactEvent) -> Result<(), ValidationError> {
        if artifact.id.trim().is_empty() {
            return Err(ValidationError::new("id", "id must be a non-empty string"));
        }

        if Url::parse(&artifact.uri).is_err() {
            return Err(ValidationError::new("uri", "uri must be a valid URL"));
        }

        if !self.is_mime_type_allowed(&artifact.mime_type) {
            return Err(ValidationError::new(
                "mime_type",
                format!("mime_type '{}' is not allowed", artifact.mime_type),
            ));
        }

        if artifact.bytes == 0 {
            return Err(ValidationError::new("bytes", "bytes must be a positive number"));
        }
        if artifact.bytes > self.limits.max_artifact_bytes {
            return Err(ValidationError::new(
                "bytes",
                format!(
                    "bytes {} exceeds maximum artifact size of {} bytes",
                    artifact.bytes, self.limits.max_artifact_bytes
                ),
            ));
        }

        Ok(())
    }

    // ========================================================================
    // Structural checks
    // ========================================================================

    /// String/array ceilings over the serialized tree, then the size ceiling
    fn check_tree(&self, event: &StreamingEvent) -> Result<(), ValidationError> {
        let value = serde_json::to_value(event)
            .map_err(|e| ValidationError::new("event", format!("event is not serializable: {}", e)))?;

        self.check_value(&value, "$")?;

        // Compact JSON length is the upper bound for what goes on the wire
        let size = value.to_string().len();
        if size > self.limits.max_event_bytes {
            return Err(ValidationError::new(
                "event",
                format!(
                    "event size {} bytes exceeds maximum of {} bytes",
                    size, self.limits.max_event_bytes
                ),
            ));
        }

        Ok(())
    }

    fn check_value(&self, value: &Value, path: &str) -> Result<(), ValidationError> {
        match value {
            Value::String(s) => {
                let len = s.chars().count();
                if len > self.limits.max_string_length {
                    return Err(ValidationError::new(
                        path,
                        format!(
                            "{} exceeds maximum string length of {} ({} characters)",
                            path, self.limits.max_string_length, len
                        ),
                    ));
                }
            }
            Value::Array(items) => {
                if items.len() > self.limits.max_array_length {
                    return Err(ValidationError::new(
                        path,
                        format!(
                            "{} exceeds maximum array length of {} ({} elements)",
                            path,
                            self.limits.max_array_length,
                            items.len()
                        ),
                    ));
                }
                for (i, item) in items.iter().enumerate() {
                    self.check_value(item, &format!("{}[{}]", path, i))?;
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    self.check_value(item, &format!("{}.{}", path, key))?;
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        Ok(())
    }
}
