// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `POST /v1/messages` — the native chat surface, unary and streaming.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use switchboard_protocol::claude::{MessagesRequest, StreamEvent};

use crate::api::error_response;
use crate::server::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Json(req): Json<MessagesRequest>,
) -> Response {
    let mut ctx = state.dispatcher.begin_context(&req);

    if !req.stream {
        return match state.dispatcher.dispatch_unary(&req, &mut ctx).await {
            Ok(resp) => Json(resp).into_response(),
            Err(e) => error_response(&e),
        };
    }

    if state.config.wait_progress_updates {
        // Open the SSE response immediately so progress pings can flow
        // while the dispatcher waits for a rate-limit reset.  Pre-flight
        // failures arrive as `error` events on the open stream.
        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            let progress = tx.clone();
            match dispatcher.dispatch_stream(&req, &mut ctx, Some(progress)).await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            error: switchboard_protocol::claude::ApiError {
                                kind: e.kind_label().into(),
                                message: e.to_string(),
                            },
                        })
                        .await;
                }
            }
        });
        return sse_response(ReceiverStream::new(rx));
    }

    // Without progress updates the stream opens only after an upstream
    // connection exists, so failures keep their proper HTTP status.
    match state.dispatcher.dispatch_stream(&req, &mut ctx, None).await {
        Ok(events) => sse_response(events),
        Err(e) => error_response(&e),
    }
}

fn sse_response(
    events: impl futures::Stream<Item = StreamEvent> + Send + 'static,
) -> Response {
    let stream = events.map(|event| {
        Ok::<Event, Infallible>(match Event::default().event(event.event_name()).json_data(&event)
        {
            Ok(ev) => ev,
            Err(e) => {
                error!(error = %e, "failed to serialise stream event");
                Event::default().event("error").data(
                    r#"{"type":"error","error":{"type":"api_error","message":"event serialisation failed"}}"#,
                )
            }
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
