// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `POST /v1/chat/completions` — the OpenAI-compatible surface.
//!
//! Requests are translated to the native format, run through the same
//! dispatcher, and translated back.  Streaming maps text and reasoning
//! deltas onto `choices[0].delta.content` and terminates with a
//! `finish_reason` chunk followed by the `[DONE]` sentinel.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::StreamExt;
use tracing::error;

use switchboard_protocol::claude::{Delta, StreamEvent};
use switchboard_protocol::openai::{
    from_messages_response, to_messages_request, ChatCompletionChunk, ChatCompletionRequest,
};

use crate::api::error_response;
use crate::server::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Json(oreq): Json<ChatCompletionRequest>,
) -> Response {
    let req = to_messages_request(oreq);
    let mut ctx = state.dispatcher.begin_context(&req);
    let created = chrono::Utc::now().timestamp().max(0) as u64;
    let chat_id = format!("chatcmpl_{}", uuid::Uuid::new_v4().simple());
    let model = req.model.clone();

    if !req.stream {
        return match state.dispatcher.dispatch_unary(&req, &mut ctx).await {
            Ok(resp) => Json(from_messages_response(&resp, created)).into_response(),
            Err(e) => error_response(&e),
        };
    }

    let events = match state.dispatcher.dispatch_stream(&req, &mut ctx, None).await {
        Ok(events) => events,
        Err(e) => return error_response(&e),
    };

    // Chunk translation: role preamble, content deltas, finish, [DONE].
    let head = futures::stream::once({
        let chunk = ChatCompletionChunk::role(&chat_id, &model, created);
        async move { to_sse_event(&chunk) }
    });
    let body = events.filter_map(move |event| {
        let chunk = match &event {
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                Delta::TextDelta { text } => {
                    Some(ChatCompletionChunk::content(&chat_id, &model, created, text))
                }
                // This surface has no reasoning channel; thinking
                // streams as ordinary content.
                Delta::ThinkingDelta { thinking } => {
                    Some(ChatCompletionChunk::content(&chat_id, &model, created, thinking))
                }
                _ => None,
            },
            StreamEvent::MessageDelta { delta, .. } => {
                Some(ChatCompletionChunk::finish(&chat_id, &model, created, delta.stop_reason))
            }
            _ => None,
        };
        futures::future::ready(chunk.map(|c| to_sse_event(&c)))
    });
    let tail = futures::stream::once(async {
        Ok::<Event, Infallible>(Event::default().data("[DONE]"))
    });

    Sse::new(head.chain(body).chain(tail))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn to_sse_event(chunk: &ChatCompletionChunk) -> Result<Event, Infallible> {
    Ok(match Event::default().json_data(chunk) {
        Ok(ev) => ev,
        Err(e) => {
            error!(error = %e, "failed to serialise chat chunk");
            Event::default().data("{}")
        }
    })
}
