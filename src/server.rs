// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP server assembly: router, shared state, graceful shutdown.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::info;

use switchboard_core::Dispatcher;
use switchboard_config::Config;

/// Request bodies above this are rejected outright (images arrive
/// base64-inflated, so the ceiling is generous).
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(crate::api::messages::handle))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/chat/completions", post(crate::api::openai::handle))
        .route("/v1/models", get(crate::api::models::list))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn serve(config: Arc<Config>, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let state = AppState { config: Arc::clone(&config), dispatcher: Arc::clone(&dispatcher) };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down; flushing persisted state");
    dispatcher.pool.flush();
    dispatcher.signatures.flush();
    dispatcher.usage.flush();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Token counting is not implemented; the truncation heuristic does not
/// pretend to be a tokenizer.
async fn count_tokens() -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(serde_json::json!({
            "type": "error",
            "error": {
                "type": "not_implemented",
                "message": "token counting is not supported by this proxy"
            }
        })),
    )
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let accounts = state.dispatcher.pool.accounts();
    let usable = accounts.iter().filter(|a| a.enabled && !a.invalid).count();
    Json(serde_json::json!({
        "status": "ok",
        "accounts": accounts.len(),
        "accounts_available": usable,
        "sessions": state.dispatcher.sessions.len(),
    }))
}
