// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API error responses.
//!
//! Every error carries a reference code that is also written to the server
//! log, so a user report can be matched to the full internal details.
//! Internal errors never echo those details back to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;

use crate::download::JobError;

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

/// Error body returned by the HTTP API.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ApiError {
    /// Malformed body or unsupported URL (400)
    InvalidRequest {
        message: String,
        reference: String,
        field: Option<String>,
    },

    /// Unknown job (404)
    NotFound { message: String, reference: String },

    /// Operation not allowed in the job's current state (409)
    Conflict { message: String, reference: String },

    /// Internal server error (500)
    InternalError { message: String, reference: String },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            ApiError::InvalidRequest { reference, .. }
            | ApiError::NotFound { reference, .. }
            | ApiError::Conflict { reference, .. }
            | ApiError::InternalError { reference, .. } => reference,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidRequest { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Conflict { message, .. }
            | ApiError::InternalError { message, .. } => message,
        }
    }

    pub fn invalid_request(user_message: &str, field: Option<&str>) -> Self {
        let reference = generate_reference_code();
        tracing::warn!(reference = %reference, field = ?field, message = %user_message, "Invalid request");
        Self::InvalidRequest {
            message: user_message.to_string(),
            reference,
            field: field.map(str::to_string),
        }
    }

    pub fn not_found(resource: &str) -> Self {
        let reference = generate_reference_code();
        tracing::debug!(reference = %reference, resource = %resource, "Not found");
        Self::NotFound {
            message: format!("{} not found.", resource),
            reference,
        }
    }

    pub fn conflict(user_message: &str) -> Self {
        let reference = generate_reference_code();
        tracing::info!(reference = %reference, message = %user_message, "Conflict");
        Self::Conflict {
            message: user_message.to_string(),
            reference,
        }
    }

    /// Log `internal_error` and return a generic message.
    pub fn internal_error(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(reference = %reference, internal_error = %internal_error, "Internal error");
        Self::InternalError {
            message: "An internal error occurred. Please quote the reference code when reporting it."
                .to_string(),
            reference,
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match &err {
            JobError::UnsupportedSource(_) => ApiError::invalid_request(&err.to_string(), Some("url")),
            JobError::NotFound(_) => ApiError::not_found("Download job"),
            JobError::NotRetryable { .. } => ApiError::conflict(&err.to_string()),
        }
    }
}

/// JSON envelope for [`ApiError`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ApiError,
    pub status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}

/// Result alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
