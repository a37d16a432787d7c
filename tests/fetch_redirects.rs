// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fetcher behavior against a local origin: header scoping across redirects,
//! error bodies and range resume.

mod common;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use modelvault::download::FetchError;

use common::{fetcher, payload, Origin};

fn auth() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
    headers
}

#[tokio::test]
async fn test_auth_kept_on_same_host_redirect() {
    let origin = Origin::start().await;
    let body = fetcher()
        .fetch_to_buffer(&origin.url("/redirect/same"), &auth())
        .await
        .unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), "Bearer secret");
}

#[tokio::test]
async fn test_auth_dropped_on_cross_host_redirect() {
    let origin = Origin::start().await;
    let body = fetcher()
        .fetch_to_buffer(&origin.url("/redirect/cross"), &auth())
        .await
        .unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), "none");
}

#[tokio::test]
async fn test_error_status_carries_body() {
    let origin = Origin::start().await;
    let err = fetcher()
        .fetch_to_buffer(&origin.url("/files/forbidden"), &HeaderMap::new())
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(403));
    match &err {
        FetchError::Status { body, url, .. } => {
            assert_eq!(body, "quota exceeded for this token");
            assert!(url.ends_with("/files/forbidden"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.to_string().starts_with("HTTP 403 from "));
}

#[tokio::test]
async fn test_failed_status_creates_no_file() {
    let origin = Origin::start().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("model.bin");

    let err = fetcher()
        .fetch_to_file(
            &origin.url("/files/forbidden"),
            &dest,
            &HeaderMap::new(),
            0,
            |_| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(403));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_resume_appends_partial_content() {
    let origin = Origin::start().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("model.bin");
    std::fs::write(&dest, &payload()[..300]).unwrap();

    let mut last = None;
    let outcome = fetcher()
        .fetch_to_file(
            &origin.url("/files/model.bin"),
            &dest,
            &HeaderMap::new(),
            300,
            |p| last = Some(p),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.bytes, 1000);
    assert_eq!(outcome.total, 1000);
    assert_eq!(std::fs::read(&dest).unwrap(), payload());
    let last = last.unwrap();
    assert_eq!(last.downloaded(), 1000);
    assert_eq!(last.percent(), 100.0);
}

#[tokio::test]
async fn test_unsatisfiable_range_restarts_from_zero() {
    let origin = Origin::start().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("model.bin");
    std::fs::write(&dest, vec![0u8; 1200]).unwrap();

    let outcome = fetcher()
        .fetch_to_file(
            &origin.url("/files/model.bin"),
            &dest,
            &HeaderMap::new(),
            1200,
            |_| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.bytes, 1000);
    assert_eq!(std::fs::read(&dest).unwrap(), payload());
}

#[tokio::test]
async fn test_cancel_deletes_destination() {
    let origin = Origin::start().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("slow.bin");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    let err = fetcher()
        .fetch_to_file(
            &origin.url("/files/slow"),
            &dest,
            &HeaderMap::new(),
            0,
            move |p| {
                if p.downloaded() >= common::SLOW_SENT as u64 {
                    trigger.cancel();
                }
            },
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.to_string(), "Download cancelled");
    assert!(!dest.exists());
}
