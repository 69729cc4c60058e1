//! In-memory artifact store with signed retrieval URLs
//!
//! Retrieval URLs have the form
//! `{base_url}/artifacts/{id}?expires={unix_ts}&signature={hmac}` where the
//! signature is an HMAC-SHA256 over `{id}:{expires}`.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use mcpstream_core::{ArtifactError, ArtifactMetadata, ArtifactStore, SignedUrl, StoredArtifact};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::auth::{base64_url_decode, base64_url_encode};

type HmacSha256 = Hmac<Sha256>;

/// Default lifetime of a signed URL
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(15 * 60);

pub struct InMemoryArtifactStore {
    artifacts: DashMap<String, StoredArtifact>,
    base_url: String,
    signing_key: Zeroizing<Vec<u8>>,
    max_bytes: u64,
    url_ttl: Duration,
}

impl InMemoryArtifactStore {
    pub fn new(base_url: impl Into<String>, signing_key: impl Into<Vec<u8>>, max_bytes: u64) -> Self {
        Self {
            artifacts: DashMap::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_key: Zeroizing::new(signing_key.into()),
            max_bytes,
            url_ttl: DEFAULT_URL_TTL,
        }
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Check a signed URL's query parameters
    pub fn verify_signature(
        &self,
        id: &str,
        expires: i64,
        signature: &str,
    ) -> Result<(), ArtifactError> {
        if Utc::now().timestamp() > expires {
            return Err(ArtifactError::Expired);
        }

        let signature = base64_url_decode(signature).ok_or(ArtifactError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(signing_input(id, expires).as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ArtifactError::InvalidSignature)
    }

    /// Periodically drop expired artifacts until `shutdown` fires
    pub fn spawn_cleanup(self: Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Ok(removed) = self.cleanup_expired().await {
                            if removed > 0 {
                                info!(removed = removed, "[Artifacts] Expired artifacts removed");
                            }
                        }
                    }
                }
            }
        })
    }

    fn mac(&self) -> Result<HmacSha256, ArtifactError> {
        HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| ArtifactError::Storage(e.to_string()))
    }
}

fn signing_input(id: &str, expires: i64) -> String {
    format!("{}:{}", id, expires)
}

/// `sha256-<base64>` integrity digest
pub fn integrity_hash(data: &[u8]) -> String {
    format!("sha256-{}", STANDARD.encode(Sha256::digest(data)))
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn store(&self, data: Vec<u8>, metadata: ArtifactMetadata) -> Result<String, ArtifactError> {
        if data.is_empty() {
            return Err(ArtifactError::Empty);
        }
        let size = data.len() as u64;
        if size > self.max_bytes {
            return Err(ArtifactError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = match metadata.ttl {
            Some(ttl) => Some(
                chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|ttl| now.checked_add_signed(ttl))
                    .ok_or(ArtifactError::TtlOutOfRange(ttl.as_secs()))?,
            ),
            None => None,
        };

        let artifact = StoredArtifact {
            id: id.clone(),
            mime_type: metadata.mime_type,
            hash: integrity_hash(&data),
            data,
            filename: metadata.filename,
            extra: metadata.extra,
            created_at: now,
            expires_at,
        };

        debug!(
            artifact_id = %id,
            mime_type = %artifact.mime_type,
            bytes = size,
            "[Artifacts] Stored"
        );
        self.artifacts.insert(id.clone(), artifact);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<StoredArtifact, ArtifactError> {
        let artifact = self
            .artifacts
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| ArtifactError::NotFound(id.to_string()))?;

        if artifact.is_expired(Utc::now()) {
            self.artifacts.remove(id);
            return Err(ArtifactError::NotFound(id.to_string()));
        }
        Ok(artifact)
    }

    async fn signed_url(&self, id: &str, ttl: Option<Duration>) -> Result<SignedUrl, ArtifactError> {
        let artifact = self.get(id).await?;

        let ttl = ttl.unwrap_or(self.url_ttl);
        let mut expires = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| Utc::now().timestamp().checked_add(secs))
            .ok_or(ArtifactError::TtlOutOfRange(ttl.as_secs()))?;
        if let Some(artifact_expiry) = artifact.expires_at {
            expires = expires.min(artifact_expiry.timestamp());
        }

        let mut mac = self.mac()?;
        mac.update(signing_input(id, expires).as_bytes());
        let signature = base64_url_encode(&mac.finalize().into_bytes());

        let expires_at: DateTime<Utc> = Utc
            .timestamp_opt(expires, 0)
            .single()
            .ok_or(ArtifactError::TtlOutOfRange(ttl.as_secs()))?;

        Ok(SignedUrl {
            url: format!(
                "{}/artifacts/{}?expires={}&signature={}",
                self.base_url, id, expires, signature
            ),
            expires_at,
        })
    }

    async fn delete(&self, id: &str) -> Result<bool, ArtifactError> {
        Ok(self.artifacts.remove(id).is_some())
    }

    async fn exists(&self, id: &str) -> Result<bool, ArtifactError> {
        Ok(self.get(id).await.is_ok())
    }

    async fn cleanup_expired(&self) -> Result<usize, ArtifactError> {
        let now = Utc::now();
        let before = self.artifacts.len();
        self.artifacts.retain(|_, artifact| !artifact.is_expired(now));
        Ok(before.saturating_sub(self.artifacts.len()))
    }
}
