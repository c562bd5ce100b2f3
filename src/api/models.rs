// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `GET /v1/models` — OpenAI-compatible model listing.
//!
//! Built from upstream model discovery when an account is available,
//! falling back to the static set of supported models.  The
//! `model_mapping` config hides models and adds aliases.

use std::collections::BTreeSet;

use axum::{extract::State, response::Json};

use switchboard_protocol::openai::ModelList;
use switchboard_upstream::AccountCredential;

use crate::server::AppState;

/// Models always advertised, even before the first upstream discovery.
const STATIC_MODELS: &[&str] = &[
    "gemini-3-pro-preview",
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "gpt-oss-120b",
];

pub async fn list(State(state): State<AppState>) -> Json<ModelList> {
    let mut ids: BTreeSet<String> = STATIC_MODELS.iter().map(|m| m.to_string()).collect();

    if let Some(discovered) = discover(&state).await {
        ids.extend(discovered);
    }

    // Apply mapping config: hidden models disappear, aliases appear.
    for (model, entry) in &state.config.model_mapping {
        if entry.hidden {
            ids.remove(model);
        }
        if let Some(alias) = &entry.alias {
            ids.insert(alias.clone());
        }
    }

    let created = chrono::Utc::now().timestamp().max(0) as u64;
    Json(ModelList::new(ids.into_iter().collect(), created))
}

/// Try upstream discovery through the first account that has a cached
/// project id.  Discovery is best-effort; listing never fails.
async fn discover(state: &AppState) -> Option<Vec<String>> {
    let dispatcher = &state.dispatcher;
    let account = dispatcher
        .pool
        .accounts()
        .into_iter()
        .find(|a| a.enabled && !a.invalid && a.project_id.is_some())?;

    let credential = AccountCredential {
        refresh_token: account.credential.refresh_token.clone(),
        api_key: account.credential.api_key.clone(),
    };
    let token = dispatcher
        .tokens
        .bearer_token(&account.email, &credential)
        .await
        .ok()?;
    let project = account.project_id.as_deref()?;
    let quotas = dispatcher
        .upstream
        .fetch_available_models(&token, project)
        .await
        .ok()?;

    // Filter to families this proxy can actually translate for.
    Some(
        quotas
            .into_iter()
            .map(|q| q.model)
            .filter(|m| {
                let id = m.to_ascii_lowercase();
                id.contains("gemini") || id.contains("claude") || id.contains("gpt")
            })
            .collect(),
    )
}
