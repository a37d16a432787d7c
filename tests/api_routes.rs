// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP API routes driven through the router.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use modelvault::server::router;

use common::{manager, wait_terminal, MockResolver, Origin};

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_create_list_and_clear() {
    let origin = Origin::start().await;
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, Arc::new(MockResolver::new(origin.url("/files/model.bin"))), 3);
    let app = router(manager.clone());

    let (status, job) = send(
        &app,
        post_json(
            "/api/downloads",
            json!({"url": "https://civarchive.com/models/42", "baseModel": "SDXL 1.0"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["source"], "civarchive");
    assert_eq!(job["options"]["baseModel"], "SDXL 1.0");
    let id = job["id"].as_str().unwrap().to_string();

    wait_terminal(&manager, &id).await;

    let (status, one) = send(&app, Request::get(format!("/api/downloads/{}", id)).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["status"], "completed");
    assert_eq!(one["progress"]["percent"], 100.0);

    let (_, list) = send(&app, Request::get("/api/downloads").body(Body::empty()).unwrap()).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, cancel) = send(
        &app,
        Request::post(format!("/api/downloads/{}/cancel", id)).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancel["cancelled"], false);

    let (status, retry) = send(
        &app,
        Request::post(format!("/api/downloads/{}/retry", id)).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(retry["error"]["error_type"], "conflict");

    let (_, cleared) = send(
        &app,
        Request::delete("/api/downloads/completed").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(cleared["removed"], 1);

    let (status, _) = send(&app, Request::get(format!("/api/downloads/{}", id)).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_event_stream_ends_with_terminal_update() {
    let origin = Origin::start().await;
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, Arc::new(MockResolver::new(origin.url("/files/model.bin"))), 3);
    let app = router(manager.clone());

    let (_, job) = send(
        &app,
        post_json("/api/downloads", json!({"url": "https://civarchive.com/models/42"})),
    )
    .await;
    let id = job["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/downloads/{}/events", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = tokio::time::timeout(
        Duration::from_secs(10),
        to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("event stream ends after the job finishes")
    .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.starts_with("event: "), "{}", text);
    assert!(text.contains("event: completed"), "{}", text);
    let last_data = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .last()
        .unwrap();
    let last: Value = serde_json::from_str(last_data).unwrap();
    assert_eq!(last["status"], "completed");
}

#[tokio::test]
async fn test_events_for_unknown_job_is_404() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, Arc::new(MockResolver::new("http://127.0.0.1:9/x".into())), 3);
    let app = router(manager);

    let (status, body) = send(
        &app,
        Request::get("/api/downloads/missing/events").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["message"], "Download job not found.");
}

#[tokio::test]
async fn test_create_rejects_empty_url() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, Arc::new(MockResolver::new("http://127.0.0.1:9/x".into())), 3);
    let app = router(manager);

    let (status, body) = send(&app, post_json("/api/downloads", json!({"url": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["field"], "url");
    assert_eq!(body["status"], 400);
}
