// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod messages;
pub mod models;
pub mod openai;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use switchboard_core::DispatchError;

/// Map a dispatch failure onto the client error envelope and status.
pub fn error_response(err: &DispatchError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({
            "type": "error",
            "error": { "type": err.kind_label(), "message": err.to_string() }
        })),
    )
        .into_response()
}
