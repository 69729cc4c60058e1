//! Artifact store contract
//!
//! Large binary results (map images, GeoJSON, PDFs) never travel inside
//! events. A tool stores the bytes, then publishes an artifact event that
//! carries only the retrieval URI, size and MIME type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Descriptive data supplied when storing an artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub mime_type: String,
    /// Optional human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Time to live; `None` keeps the artifact until deleted
    #[serde(default, skip_serializing_if = "Option::is_none", with = "ttl_millis")]
    pub ttl: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
}

/// An artifact as held by a store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub id: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// `sha256-<base64>` digest of `data`
    pub hash: String,
    pub filename: Option<String>,
    pub extra: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredArtifact {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A time-limited retrieval URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    #[error("artifact '{0}' not found")]
    NotFound(String),

    #[error("artifact size {size} bytes exceeds maximum of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("artifact is empty")]
    Empty,

    #[error("mime_type '{0}' is not allowed")]
    MimeTypeNotAllowed(String),

    #[error("signed URL has expired")]
    Expired,

    #[error("ttl of {0} seconds is out of range")]
    TtlOutOfRange(u64),

    #[error("signed URL signature is invalid")]
    InvalidSignature,

    #[error("artifact storage failed: {0}")]
    Storage(String),
}

/// Storage backend for artifact bytes
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store bytes and return the new artifact id
    async fn store(&self, data: Vec<u8>, metadata: ArtifactMetadata) -> Result<String, ArtifactError>;

    /// Fetch an artifact; expired artifacts are reported as not found
    async fn get(&self, id: &str) -> Result<StoredArtifact, ArtifactError>;

    /// Produce a retrieval URL valid for `ttl` (store default if `None`)
    async fn signed_url(&self, id: &str, ttl: Option<Duration>) -> Result<SignedUrl, ArtifactError>;

    /// Delete an artifact; returns false if it did not exist
    async fn delete(&self, id: &str) -> Result<bool, ArtifactError>;

    async fn exists(&self, id: &str) -> Result<bool, ArtifactError>;

    /// Drop expired artifacts and return how many were removed
    async fn cleanup_expired(&self) -> Result<usize, ArtifactError>;
}

mod ttl_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(ttl) => s.serialize_u64(ttl.as_millis() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
