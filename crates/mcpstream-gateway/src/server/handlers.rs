//! HTTP handlers for the gateway server

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use mcpstream_core::{
    ArtifactError, ArtifactFields, ArtifactMetadata, ArtifactStore, ContextState, Scope,
    SignalPayload, StreamingContext, StreamingEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::error::ApiError;
use super::state::AppState;
use crate::auth::BearerCredential;
use crate::stream::{ChannelSink, ConnectionRequest, EventFilter, RouterStatistics};

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Health
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    debug!("[Gateway] Health check");
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Streams (producer side)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateStreamRequest {
    /// Caller-chosen id; generated if absent
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Public view of a streaming context
#[derive(Debug, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub state: ContextState,
    pub current_sequence: u64,
    pub created_at: DateTime<Utc>,
    pub connected: bool,
}

impl StreamInfo {
    fn new(context: &StreamingContext, connected: bool) -> Self {
        Self {
            id: context.id().to_string(),
            state: context.state(),
            current_sequence: context.current_sequence(),
            created_at: context.created_at(),
            connected,
        }
    }
}

/// Parse an optional JSON body; empty bodies yield the default
fn optional_json<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn find_context(state: &AppState, id: &str) -> ApiResult<Arc<StreamingContext>> {
    state
        .contexts
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("stream '{}'", id)))
}

fn stream_info(state: &AppState, context: &StreamingContext) -> StreamInfo {
    StreamInfo::new(context, state.router.connection(context.id()).is_some())
}

/// POST /streams
pub async fn create_stream(
    State(state): State<AppState>,
    credential: BearerCredential,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<StreamInfo>)> {
    state.router.authorize(credential.as_deref(), Scope::Write)?;
    let request: CreateStreamRequest = optional_json(&body)?;

    if matches!(request.id.as_deref(), Some(id) if id.trim().is_empty()) {
        return Err(ApiError::BadRequest("id must not be empty".to_string()));
    }

    let context = state.contexts.create(request.id.clone()).ok_or_else(|| {
        ApiError::Conflict(format!(
            "stream '{}' already exists",
            request.id.unwrap_or_default()
        ))
    })?;

    info!(context_id = %context.id(), "[Gateway] Stream created");
    Ok((StatusCode::CREATED, Json(stream_info(&state, &context))))
}

/// GET /streams/{id}
pub async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    credential: BearerCredential,
) -> ApiResult<Json<StreamInfo>> {
    state.router.authorize(credential.as_deref(), Scope::Read)?;
    let context = find_context(&state, &id)?;
    Ok(Json(stream_info(&state, &context)))
}

/// POST /streams/{id}/events
pub async fn publish_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    credential: BearerCredential,
    Json(payload): Json<SignalPayload>,
) -> ApiResult<(StatusCode, Json<StreamingEvent>)> {
    state.router.authorize(credential.as_deref(), Scope::Write)?;
    let context = find_context(&state, &id)?;

    let event = context.emit_signal(payload)?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ArtifactUploadQuery {
    /// Artifact lifetime in seconds
    pub ttl_secs: Option<u64>,
    pub filename: Option<String>,
}

/// POST /streams/{id}/artifacts
///
/// The body is the raw artifact; `Content-Type` gives its MIME type.
pub async fn upload_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ArtifactUploadQuery>,
    credential: BearerCredential,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<StreamingEvent>)> {
    state.router.authorize(credential.as_deref(), Scope::Write)?;
    let context = find_context(&state, &id)?;
    if !context.is_active() {
        return Err(ApiError::Conflict(format!(
            "stream '{}' is {}",
            id,
            context.state().as_str()
        )));
    }

    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if !state.validator.is_mime_type_allowed(&mime_type) {
        return Err(ArtifactError::MimeTypeNotAllowed(mime_type).into());
    }

    let ttl = query.ttl_secs.map(Duration::from_secs);
    let artifact_id = state
        .artifacts
        .store(
            body.to_vec(),
            ArtifactMetadata {
                mime_type: mime_type.clone(),
                filename: query.filename.clone(),
                ttl,
                extra: None,
            },
        )
        .await?;

    let stored = state.artifacts.get(&artifact_id).await?;
    let signed = state.artifacts.signed_url(&artifact_id, ttl).await?;

    let metadata = query.filename.map(|filename| {
        let mut map = Map::new();
        map.insert("filename".to_string(), Value::String(filename));
        map
    });

    let emitted = context.emit_artifact(ArtifactFields {
        id: artifact_id.clone(),
        uri: signed.url,
        mime_type,
        bytes: stored.size() as i64,
        hash: Some(stored.hash),
        expires_at: Some(signed.expires_at),
        metadata,
        seq: None,
        timestamp: Some(stored.created_at),
    });

    match emitted {
        Ok(event) => Ok((StatusCode::CREATED, Json(event))),
        Err(e) => {
            state.artifacts.delete(&artifact_id).await?;
            Err(e.into())
        }
    }
}

/// POST /streams/{id}/complete
pub async fn complete_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    credential: BearerCredential,
) -> ApiResult<Json<StreamInfo>> {
    state.router.authorize(credential.as_deref(), Scope::Write)?;
    let context = find_context(&state, &id)?;

    if !context.complete() {
        return Err(ApiError::Conflict(format!(
            "stream '{}' is already {}",
            id,
            context.state().as_str()
        )));
    }
    info!(context_id = %id, "[Gateway] Stream completed");
    Ok(Json(stream_info(&state, &context)))
}

/// POST /streams/{id}/cancel
pub async fn cancel_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    credential: BearerCredential,
    body: Bytes,
) -> ApiResult<Json<StreamInfo>> {
    state.router.authorize(credential.as_deref(), Scope::Write)?;
    let context = find_context(&state, &id)?;
    let request: CancelRequest = optional_json(&body)?;

    if !context.cancel(request.reason) {
        return Err(ApiError::Conflict(format!(
            "stream '{}' is already {}",
            id,
            context.state().as_str()
        )));
    }
    info!(context_id = %id, "[Gateway] Stream cancelled");
    Ok(Json(stream_info(&state, &context)))
}

// ============================================================================
// Streams (consumer side)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeQuery {
    pub batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub heartbeat_ms: Option<u64>,
    /// Comma-separated event types (`progress`, `artifact`, ...); all if absent
    pub types: Option<String>,
}

impl SubscribeQuery {
    fn filter(&self) -> Option<EventFilter> {
        let types: Vec<String> = self
            .types
            .as_deref()?
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if types.is_empty() {
            return None;
        }
        Some(Arc::new(move |event: &StreamingEvent| {
            types
                .iter()
                .any(|t| t == event.type_name() || t == event.family().as_str())
        }))
    }
}

/// GET /streams/{id}/events - open an SSE connection
pub async fn subscribe(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SubscribeQuery>,
    credential: BearerCredential,
) -> ApiResult<Response> {
    state.router.authorize(credential.as_deref(), Scope::Read)?;
    let context = find_context(&state, &id)?;

    let request = ConnectionRequest {
        context_id: id.clone(),
        filter: query.filter(),
        batch_size: query.batch_size,
        batch_timeout: query.batch_timeout_ms.map(Duration::from_millis),
        heartbeat_interval: query.heartbeat_ms.map(Duration::from_millis),
        on_error: None,
    };

    let (sink, mut rx) = ChannelSink::new(state.sink_capacity);
    let connection =
        state
            .router
            .create_connection(credential.as_deref(), request, context, Arc::new(sink))?;

    debug!(
        context_id = %id,
        connection_id = %connection.id(),
        "[Gateway] SSE stream opened"
    );

    let stream = async_stream::stream! {
        while let Some(record) = rx.recv().await {
            yield Ok::<_, Infallible>(record);
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// DELETE /streams/{id}/connection
pub async fn close_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    credential: BearerCredential,
) -> ApiResult<Json<Value>> {
    let closed = state
        .router
        .close_connection(credential.as_deref(), &id)
        .await?;
    Ok(Json(json!({ "context_id": id, "closed": closed })))
}

/// GET /stats
pub async fn stats(
    State(state): State<AppState>,
    credential: BearerCredential,
) -> ApiResult<Json<RouterStatistics>> {
    Ok(Json(state.router.statistics(credential.as_deref())?))
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SignedUrlQuery {
    pub expires: i64,
    pub signature: String,
}

/// GET /artifacts/{id} - fetch artifact bytes through a signed URL
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SignedUrlQuery>,
) -> ApiResult<Response> {
    state
        .artifacts
        .verify_signature(&id, query.expires, &query.signature)?;
    let artifact = state.artifacts.get(&id).await?;

    Ok((
        [(header::CONTENT_TYPE, artifact.mime_type)],
        artifact.data,
    )
        .into_response())
}
