//! Streaming configuration
//!
//! All limits and tuning constants of the delivery subsystem live here so
//! they can be injected instead of read from globals:
//! - `ValidationLimits` - event shape and size ceilings
//! - `DeliveryTuning` - backpressure retention and circuit-breaker constants
//! - `ConnectionDefaults` - per-connection batching and heartbeat defaults
//!
//! Values can be overridden from `MCPSTREAM_*` environment variables.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default ceiling on concurrently registered connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;

/// Smallest heartbeat interval a connection may request
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Largest batch size a connection may request
pub const MAX_BATCH_SIZE: usize = 100;

/// Limits enforced when events are constructed
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationLimits {
    /// Maximum serialized event size in bytes
    pub max_event_bytes: usize,
    /// Maximum length of any string field, in characters
    pub max_string_length: usize,
    /// Maximum number of elements in any array field
    pub max_array_length: usize,
    /// Maximum artifact size in bytes
    pub max_artifact_bytes: u64,
    /// Allowed artifact MIME types; `type/*` matches a whole family
    pub allowed_mime_types: Vec<String>,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_event_bytes: 64 * 1024,
            max_string_length: 2 * 1024,
            max_array_length: 100,
            max_artifact_bytes: 10 * 1024 * 1024,
            allowed_mime_types: vec![
                "image/*".to_string(),
                "application/json".to_string(),
                "application/geo+json".to_string(),
                "application/pdf".to_string(),
                "text/csv".to_string(),
                "text/plain".to_string(),
            ],
        }
    }
}

/// Backpressure and circuit-breaker constants
///
/// The defaults are empirical and have not been validated against real
/// traffic; treat them as tunables rather than protocol guarantees.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTuning {
    /// Queue soft ceiling is `batch_size * queue_ceiling_factor`
    pub queue_ceiling_factor: usize,
    /// Share of the most recent queue entries kept when shedding
    pub retention_ratio: f64,
    /// Queue depth (in batches) that bypasses the batch timer
    pub emergency_factor: usize,
    /// Consecutive write failures that force-close a connection
    pub failure_threshold: u32,
    /// Failure-counter decrement granted when an error report is delivered
    pub recovery_credit: u32,
    /// Events written between cooperative yields during a flush
    pub flush_chunk_size: usize,
}

impl Default for DeliveryTuning {
    fn default() -> Self {
        Self {
            queue_ceiling_factor: 10,
            retention_ratio: 0.2,
            emergency_factor: 5,
            failure_threshold: 5,
            recovery_credit: 1,
            flush_chunk_size: 10,
        }
    }
}

/// Defaults applied when a connection request leaves a field unset
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDefaults {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Complete configuration of the delivery subsystem
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    pub limits: ValidationLimits,
    pub delivery: DeliveryTuning,
    pub defaults: ConnectionDefaults,
    pub max_connections: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            limits: ValidationLimits::default(),
            delivery: DeliveryTuning::default(),
            defaults: ConnectionDefaults::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl StreamingConfig {
    /// Load configuration from `MCPSTREAM_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (unset keys keep defaults)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();

        let allowed_mime_types = lookup("MCPSTREAM_ALLOWED_MIME_TYPES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|types| !types.is_empty())
            .unwrap_or(base.limits.allowed_mime_types);

        Self {
            limits: ValidationLimits {
                max_event_bytes: parse_or(&lookup, "MCPSTREAM_MAX_EVENT_BYTES", base.limits.max_event_bytes),
                max_string_length: parse_or(
                    &lookup,
                    "MCPSTREAM_MAX_STRING_LENGTH",
                    base.limits.max_string_length,
                ),
                max_array_length: parse_or(
                    &lookup,
                    "MCPSTREAM_MAX_ARRAY_LENGTH",
                    base.limits.max_array_length,
                ),
                max_artifact_bytes: parse_or(
                    &lookup,
                    "MCPSTREAM_MAX_ARTIFACT_BYTES",
                    base.limits.max_artifact_bytes,
                ),
                allowed_mime_types,
            },
            delivery: DeliveryTuning {
                retention_ratio: parse_or(&lookup, "MCPSTREAM_RETENTION_RATIO", base.delivery.retention_ratio)
                    .clamp(0.0, 1.0),
                failure_threshold: parse_or(
                    &lookup,
                    "MCPSTREAM_FAILURE_THRESHOLD",
                    base.delivery.failure_threshold,
                )
                .max(1),
                recovery_credit: parse_or(
                    &lookup,
                    "MCPSTREAM_RECOVERY_CREDIT",
                    base.delivery.recovery_credit,
                ),
                ..base.delivery
            },
            defaults: ConnectionDefaults {
                batch_size: parse_or(&lookup, "MCPSTREAM_BATCH_SIZE", base.defaults.batch_size)
                    .clamp(1, MAX_BATCH_SIZE),
                batch_timeout: Duration::from_millis(parse_or(
                    &lookup,
                    "MCPSTREAM_BATCH_TIMEOUT_MS",
                    base.defaults.batch_timeout.as_millis() as u64,
                )),
                heartbeat_interval: Duration::from_millis(parse_or(
                    &lookup,
                    "MCPSTREAM_HEARTBEAT_INTERVAL_MS",
                    base.defaults.heartbeat_interval.as_millis() as u64,
                ))
                .max(MIN_HEARTBEAT_INTERVAL),
            },
            max_connections: parse_or(&lookup, "MCPSTREAM_MAX_CONNECTIONS", base.max_connections),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key = key, value = %raw, "[Config] Ignoring unparseable value");
                default
            }
        },
        None => default,
    }
}
