//! Stream routes: scopes, publishing, lifecycle and SSE delivery

use super::{app, create_stream, json_request, request, send};
use axum::body::Body;
use axum::http::{header, Method, StatusCode};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tests::decode::{events, seqs};
use tests::fixtures::bearer;
use tests::SignalPayload;
use tower::ServiceExt;

#[tokio::test]
async fn test_health_is_public() {
    let app = app();
    let (status, body) = send(&app, request(Method::GET, "/health", None, Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_anonymous_callers_are_read_only() {
    let app = app();
    let (status, body) = send(
        &app,
        json_request(Method::POST, "/streams", None, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let id = create_stream(&app, "job-1").await;
    let (status, body) = send(&app, request(Method::GET, &format!("/streams/{}", id), None, Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "active");
}

#[tokio::test]
async fn test_invalid_token_is_unauthorized() {
    let app = app();
    let (status, body) = send(
        &app,
        json_request(Method::POST, "/streams", Some("Bearer not.a.token"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_create_stream_rejects_duplicates() {
    let app = app();
    create_stream(&app, "job-1").await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/streams",
            Some(&bearer(&["write"])),
            json!({ "id": "job-1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn test_create_stream_generates_id() {
    let app = app();
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/streams",
            Some(&bearer(&["write"])),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!body["id"].as_str().unwrap().is_empty());
    assert_eq!(body["current_sequence"], 0);
}

#[tokio::test]
async fn test_publish_assigns_sequence_and_validates() {
    let app = app();
    let id = create_stream(&app, "job").await;
    let writer = bearer(&["write"]);
    let uri = format!("/streams/{}/events", id);

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            &uri,
            Some(&writer),
            json!({ "type": "progress", "pct": 25.0, "message": "parsing" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["seq"], 1);
    assert_eq!(body["family"], "signal");

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            &uri,
            Some(&writer),
            json!({ "type": "progress", "pct": 250.0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
    assert_eq!(body["field"], "pct");

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            &uri,
            Some(&writer),
            json!({ "type": "status", "status": "working" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["seq"], 2);
}

#[tokio::test]
async fn test_publish_to_unknown_stream() {
    let app = app();
    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/streams/missing/events",
            Some(&bearer(&["write"])),
            json!({ "type": "status", "status": "working" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_lifecycle_transitions_once() {
    let app = app();
    let id = create_stream(&app, "job").await;
    let writer = bearer(&["write"]);

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            &format!("/streams/{}/cancel", id),
            Some(&writer),
            json!({ "reason": "user aborted" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "cancelled");

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/streams/{}/complete", id),
            Some(&writer),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            &format!("/streams/{}/events", id),
            Some(&writer),
            json!({ "type": "status", "status": "late" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "context_closed");
}

#[tokio::test]
async fn test_stats_require_admin() {
    let app = app();
    let (status, _) = send(
        &app,
        request(Method::GET, "/stats", Some(&bearer(&["read", "write"])), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        request(Method::GET, "/stats", Some(&bearer(&["admin"])), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_connections"], 0);
}

#[tokio::test]
async fn test_subscribe_streams_events_until_completion() {
    let app = app();
    let id = create_stream(&app, "job").await;
    let writer = bearer(&["write"]);
    let reader = bearer(&["read"]);

    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            &format!("/streams/{}/events?batch_size=1", id),
            Some(&reader),
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    // A second subscriber for the same stream is refused
    let (status, body) = send(
        &app,
        request(
            Method::GET,
            &format!("/streams/{}/events", id),
            Some(&reader),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "duplicate_connection");

    for pct in [30.0, 60.0] {
        let (status, _) = send(
            &app,
            json_request(
                Method::POST,
                &format!("/streams/{}/events", id),
                Some(&writer),
                json!({ "type": "progress", "pct": pct }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/streams/{}/complete", id),
            Some(&writer),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let body = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("stream ends after completion")
        .unwrap()
        .to_bytes();
    let received = events(&String::from_utf8(body.to_vec()).unwrap());

    assert_eq!(seqs(&received), vec![1, 2]);
    assert_eq!(
        received.last().and_then(|e| e.as_signal()).map(|s| &s.payload),
        Some(&SignalPayload::status("completed", None))
    );
}

#[tokio::test]
async fn test_subscribe_filters_by_type() {
    let app = app();
    let id = create_stream(&app, "job").await;
    let writer = bearer(&["write"]);

    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            &format!("/streams/{}/events?batch_size=1&types=status", id),
            Some(&bearer(&["read"])),
            Body::empty(),
        ))
        .await
        .unwrap();

    for payload in [
        json!({ "type": "progress", "pct": 10.0 }),
        json!({ "type": "status", "status": "indexing" }),
    ] {
        send(
            &app,
            json_request(
                Method::POST,
                &format!("/streams/{}/events", id),
                Some(&writer),
                payload,
            ),
        )
        .await;
    }
    send(
        &app,
        request(
            Method::POST,
            &format!("/streams/{}/complete", id),
            Some(&writer),
            Body::empty(),
        ),
    )
    .await;

    let body = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .unwrap()
        .unwrap()
        .to_bytes();
    let received = events(&String::from_utf8(body.to_vec()).unwrap());

    assert_eq!(seqs(&received), vec![2]);
    assert!(received.iter().all(|e| e.type_name() == "status"));
}

#[tokio::test]
async fn test_subscribe_rejects_bad_options() {
    let app = app();
    let id = create_stream(&app, "job").await;

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            &format!("/streams/{}/events?heartbeat_ms=10", id),
            Some(&bearer(&["read"])),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn test_close_connection_route() {
    let app = app();
    let id = create_stream(&app, "job").await;
    let writer = bearer(&["write"]);
    let uri = format!("/streams/{}/connection", id);

    let (_, body) = send(&app, request(Method::DELETE, &uri, Some(&writer), Body::empty())).await;
    assert_eq!(body["closed"], false);

    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            &format!("/streams/{}/events", id),
            Some(&bearer(&["read"])),
            Body::empty(),
        ))
        .await
        .unwrap();

    let (status, body) = send(&app, request(Method::DELETE, &uri, Some(&writer), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["closed"], true);

    // The SSE body ends once the connection is closed
    let ended = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect()).await;
    assert!(ended.is_ok());
}
