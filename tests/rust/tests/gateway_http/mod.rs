//! Gateway HTTP integration tests
//!
//! Drives the axum router in-process with `tower::ServiceExt::oneshot`.

mod routes;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use mcpstream_gateway::logging::LogConfig;
use mcpstream_gateway::{GatewayConfig, GatewayServer};
use serde_json::Value;
use tests::fixtures;
use tower::ServiceExt;

pub const BASE_URL: &str = "http://gateway.test";

pub fn server() -> GatewayServer {
    GatewayServer::new(GatewayConfig {
        base_url: Some(BASE_URL.to_string()),
        auth: fixtures::auth_config(),
        log: LogConfig {
            directory: None,
            ..Default::default()
        },
        ..Default::default()
    })
}

pub fn app() -> Router {
    server().build_router()
}

pub fn request(method: Method, uri: &str, credential: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(credential) = credential {
        builder = builder.header(header::AUTHORIZATION, credential);
    }
    builder.body(body).unwrap()
}

pub fn json_request(method: Method, uri: &str, credential: Option<&str>, body: Value) -> Request<Body> {
    let mut request = request(method, uri, credential, Body::from(body.to_string()));
    request.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    request
}

/// Send a request and decode the JSON body (`Null` when empty)
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

/// Create a stream with a writer token and return its id
pub async fn create_stream(app: &Router, id: &str) -> String {
    let writer = fixtures::bearer(&["write"]);
    let (status, body) = send(
        app,
        json_request(
            Method::POST,
            "/streams",
            Some(&writer),
            serde_json::json!({ "id": id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}
