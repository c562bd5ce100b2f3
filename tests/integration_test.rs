// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end dispatcher scenarios over a scripted upstream.
//!
//! The scripted upstream implements the same seam as the HTTP client,
//! so these tests exercise the full path: selection → permit → request
//! translation → endpoint walk → error classification → response
//! translation / relay, without any network.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use switchboard_config::{Config, SelectionStrategy};
use switchboard_core::{
    DispatchError, Dispatcher, FallbackChain, FrameStream, Upstream,
};
use switchboard_pool::{
    build_policy, Account, AccountPool, LimitType, PoolTuning, QuotaClass, QuotaKey,
    SessionTracker, SignatureCache, UsageHistory,
};
use switchboard_protocol::claude::{
    ContentBlock, Delta, Message, MessagesRequest, StopReason, StreamEvent,
};
use switchboard_protocol::gemini::GenerateEnvelope;
use switchboard_upstream::{
    classify_status, CodeAssistInfo, ModelQuota, SseFrame, TokenProvider, UpstreamError,
};

// ─── Scripted upstream ────────────────────────────────────────────────────────

#[derive(Clone)]
enum Scripted {
    /// Unary response body (also served as a single stream frame).
    Ok(Value),
    /// Stream frames served in order.
    Frames(Vec<Value>),
    /// HTTP-level failure classified exactly like the real client.
    Fail { status: u16, body: String },
}

#[derive(Default)]
struct ScriptedUpstream {
    /// Per-model result queues; the final entry repeats forever.
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    /// Every envelope the dispatcher sent, for assertions.
    envelopes: Mutex<Vec<GenerateEnvelope>>,
    calls: Mutex<u32>,
}

impl ScriptedUpstream {
    fn script(&self, model: &str, results: Vec<Scripted>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(model.to_string(), results.into());
    }

    fn next_for(&self, model: &str) -> Scripted {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.get_mut(model).expect("unscripted model");
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().expect("unscripted model")
        }
    }

    fn record(&self, envelope: &GenerateEnvelope) -> Scripted {
        *self.calls.lock().unwrap() += 1;
        self.envelopes.lock().unwrap().push(envelope.clone());
        self.next_for(&envelope.model)
    }

    fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    fn last_envelope(&self) -> GenerateEnvelope {
        self.envelopes.lock().unwrap().last().cloned().expect("no calls recorded")
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    fn hosts(&self) -> Vec<String> {
        vec!["https://primary.test".into(), "https://secondary.test".into()]
    }

    async fn generate(
        &self,
        _host: &str,
        _token: &str,
        envelope: &GenerateEnvelope,
    ) -> Result<switchboard_protocol::gemini::GenerateContentResponse, UpstreamError> {
        match self.record(envelope) {
            Scripted::Ok(v) => Ok(switchboard_protocol::gemini::GenerateContentResponse::from_json(v)
                .expect("scripted response must parse")),
            Scripted::Frames(_) => panic!("unary call hit a frames script"),
            Scripted::Fail { status, body } => Err(classify_status(status, &body, None)),
        }
    }

    async fn stream_generate(
        &self,
        _host: &str,
        _token: &str,
        envelope: &GenerateEnvelope,
    ) -> Result<FrameStream, UpstreamError> {
        let frames = match self.record(envelope) {
            Scripted::Ok(v) => vec![v],
            Scripted::Frames(frames) => frames,
            Scripted::Fail { status, body } => return Err(classify_status(status, &body, None)),
        };
        let items: Vec<Result<SseFrame, UpstreamError>> = frames
            .into_iter()
            .map(|v| Ok(SseFrame::Data(v)))
            .chain(std::iter::once(Ok(SseFrame::Done)))
            .collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn load_code_assist(&self, _token: &str) -> Result<CodeAssistInfo, UpstreamError> {
        Ok(CodeAssistInfo { project_id: Some("proj-test".into()), tier: Some("pro".into()) })
    }

    async fn fetch_available_models(
        &self,
        _token: &str,
        _project: &str,
    ) -> Result<Vec<ModelQuota>, UpstreamError> {
        Ok(Vec::new())
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────────

fn test_account(email: &str) -> Account {
    let mut account = Account::new(email);
    account.credential.api_key = Some(format!("key-{email}"));
    account.project_id = Some("proj-test".into());
    account
}

fn build(accounts: Vec<Account>, upstream: Arc<ScriptedUpstream>, config: Config) -> Arc<Dispatcher> {
    let config = Arc::new(config);
    let pool = Arc::new(AccountPool::new(PoolTuning {
        max_concurrent_requests: config.max_concurrent_requests,
        default_cooldown: Duration::from_millis(config.default_cooldown_ms),
        max_cooldown: Duration::from_millis(config.max_cooldown_ms),
        min_quota_fraction: config.account_selection.quota.low_threshold,
    }));
    for account in accounts {
        pool.add(account);
    }
    Arc::new(Dispatcher {
        policy: build_policy(&config.account_selection),
        config,
        pool,
        sessions: Arc::new(SessionTracker::new()),
        signatures: Arc::new(SignatureCache::new()),
        usage: Arc::new(UsageHistory::new()),
        tokens: Arc::new(TokenProvider::new(reqwest_client())),
        upstream,
        fallback: FallbackChain::new().unwrap(),
    })
}

fn reqwest_client() -> reqwest::Client {
    reqwest::Client::new()
}

fn sticky_config() -> Config {
    Config {
        account_selection: switchboard_config::AccountSelectionConfig {
            strategy: SelectionStrategy::Sticky,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn user_request(model: &str, text: &str) -> MessagesRequest {
    serde_json::from_value(json!({
        "model": model,
        "messages": [{ "role": "user", "content": text }]
    }))
    .unwrap()
}

fn text_success(text: &str) -> Scripted {
    Scripted::Ok(json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "finishReason": "STOP"
        }],
        "usageMetadata": {
            "promptTokenCount": 5,
            "candidatesTokenCount": 1,
            "cachedContentTokenCount": 0
        }
    }))
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unary_success_translates_and_releases_slot() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script("gpt-oss-120b", vec![text_success("hello")]);
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let req = user_request("gpt-oss-120b", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    let resp = dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap();

    assert_eq!(resp.content.len(), 1);
    assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "hello"));
    assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));
    assert_eq!(resp.usage.input_tokens, 5);
    assert_eq!(resp.usage.output_tokens, 1);
    assert_eq!(resp.usage.cache_read_input_tokens, 0);
    // The concurrency slot is back.
    assert_eq!(
        dispatcher.pool.with_account("a1@x", |a| a.active_requests).unwrap(),
        0
    );
    // Success updated last_used.
    assert!(dispatcher.pool.with_account("a1@x", |a| a.last_used.is_some()).unwrap());
}

#[tokio::test]
async fn thinking_model_unary_goes_through_stream_endpoint() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script(
        "gemini-3-pro-preview",
        vec![Scripted::Frames(vec![
            json!({ "candidates": [{ "content": { "role": "model", "parts": [{ "text": "hel" }] } }] }),
            json!({
                "candidates": [{ "content": { "role": "model", "parts": [{ "text": "lo" }] }, "finishReason": "STOP" }],
                "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 2 }
            }),
        ])],
    );
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let req = user_request("gemini-3-pro-preview", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    let resp = dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap();

    // Deltas aggregate into one text block.
    assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "hello"));
    assert_eq!(resp.usage.output_tokens, 2);
}

#[tokio::test]
async fn rate_limited_account_fails_over() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script("gpt-oss-120b", vec![text_success("ok")]);
    let dispatcher = build(
        vec![test_account("a1@x"), test_account("a2@x")],
        upstream.clone(),
        sticky_config(),
    );

    let key = QuotaKey::new("gpt-oss-120b", QuotaClass::Antigravity);
    dispatcher.pool.mark_rate_limited(
        "a1@x",
        &key,
        Some(Duration::from_secs(30)),
        LimitType::Other,
    );

    let req = user_request("gpt-oss-120b", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap();

    // a1 stayed limited, a2 served the request.
    assert!(dispatcher
        .pool
        .with_account("a1@x", |a| a.model_rate_limits[&key.as_key()].limited)
        .unwrap());
    assert!(dispatcher.pool.with_account("a2@x", |a| a.last_used.is_some()).unwrap());
    assert!(dispatcher.pool.with_account("a1@x", |a| a.last_used.is_none()).unwrap());
}

#[tokio::test(start_paused = true)]
async fn all_limited_waits_for_reset_then_succeeds() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script("gpt-oss-120b", vec![text_success("after the wait")]);
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let key = QuotaKey::new("gpt-oss-120b", QuotaClass::Antigravity);
    dispatcher.pool.mark_rate_limited(
        "a1@x",
        &key,
        Some(Duration::from_secs(2)),
        LimitType::Other,
    );

    let started = tokio::time::Instant::now();
    let req = user_request("gpt-oss-120b", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    let resp = dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap();

    assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "after the wait"));
    // The dispatcher slept out the 2s reset (plus its small buffer).
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn all_limited_with_far_reset_fails_fast_as_bad_request_status() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script("gpt-oss-120b", vec![text_success("unreachable")]);
    let mut config = sticky_config();
    config.max_wait_before_error_ms = 1_000;
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), config);

    let key = QuotaKey::new("gpt-oss-120b", QuotaClass::Antigravity);
    dispatcher.pool.mark_rate_limited(
        "a1@x",
        &key,
        Some(Duration::from_secs(600)),
        LimitType::Other,
    );

    let req = user_request("gpt-oss-120b", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    let err = dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap_err();
    match &err {
        DispatchError::RateLimited { retry_in, .. } => {
            assert!(*retry_in > Duration::from_secs(500));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    // Deliberately 400, not 429: client auto-retry storms make a bad
    // situation worse.
    assert_eq!(err.http_status(), 400);
    assert_eq!(upstream.call_count(), 0);
}

#[tokio::test]
async fn streaming_reasoning_and_tool_call_event_grammar() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let sig = "s".repeat(64);
    upstream.script(
        "gemini-3-pro-preview",
        vec![Scripted::Frames(vec![
            json!({ "candidates": [{ "content": { "role": "model", "parts": [
                { "text": "thinking about it", "thought": true }
            ] } }] }),
            json!({ "candidates": [{ "content": { "role": "model", "parts": [
                { "text": " some more", "thought": true, "thoughtSignature": sig }
            ] } }] }),
            json!({
                "candidates": [{
                    "content": { "role": "model", "parts": [
                        { "functionCall": { "name": "t", "args": { "q": "x" } }, "thoughtSignature": sig }
                    ] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 7 }
            }),
        ])],
    );
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let req: MessagesRequest = serde_json::from_value(json!({
        "model": "gemini-3-pro-preview",
        "stream": true,
        "thinking": { "type": "enabled", "budget_tokens": 4096 },
        "tools": [{
            "name": "t",
            "input_schema": { "type": "object", "properties": { "q": { "type": "string" } } }
        }],
        "messages": [{ "role": "user", "content": "hi" }]
    }))
    .unwrap();

    let mut ctx = dispatcher.begin_context(&req);
    let events: Vec<StreamEvent> = dispatcher
        .dispatch_stream(&req, &mut ctx, None)
        .await
        .unwrap()
        .collect()
        .await;

    let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta", // thinking_delta
            "content_block_delta", // thinking_delta
            "content_block_delta", // signature_delta
            "content_block_stop",
            "content_block_start",
            "content_block_delta", // input_json_delta fragment 1
            "content_block_delta", // input_json_delta fragment 2
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    // Fragments reassemble into the full argument object.
    let fragments: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta { delta: Delta::InputJsonDelta { partial_json }, .. } => {
                Some(partial_json.as_str())
            }
            _ => None,
        })
        .collect();
    assert_eq!(fragments, "{\"q\":\"x\"}");

    // Terminal frame carries the tool_use stop reason and usage.
    let delta = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::MessageDelta { delta, usage } => Some((delta, usage)),
            _ => None,
        })
        .unwrap();
    assert_eq!(delta.0.stop_reason, Some(StopReason::ToolUse));
    assert_eq!(delta.1.output_tokens, 7);

    // The tool-call signature is cached under the emitted tool id.
    let tool_id = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ContentBlockStart {
                content_block: ContentBlock::ToolUse { id, .. },
                ..
            } => Some(id.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(dispatcher.signatures.tool_signature(&tool_id).as_deref(), Some(sig.as_str()));

    // The slot is released once the stream completes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        dispatcher.pool.with_account("a1@x", |a| a.active_requests).unwrap(),
        0
    );
}

#[tokio::test]
async fn client_disconnect_frees_concurrency_slot() {
    let upstream = Arc::new(ScriptedUpstream::default());
    // A long scripted stream the client will abandon.
    let frames: Vec<Value> = (0..100)
        .map(|i| {
            json!({ "candidates": [{ "content": { "role": "model", "parts": [{ "text": format!("chunk {i}") }] } }] })
        })
        .collect();
    upstream.script("gemini-3-pro-preview", vec![Scripted::Frames(frames)]);
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let req: MessagesRequest = serde_json::from_value(json!({
        "model": "gemini-3-pro-preview",
        "stream": true,
        "messages": [{ "role": "user", "content": "hi" }]
    }))
    .unwrap();
    let mut ctx = dispatcher.begin_context(&req);
    let mut events = dispatcher.dispatch_stream(&req, &mut ctx, None).await.unwrap();

    // Read one event, then hang up.
    let _ = events.next().await;
    drop(events);

    // The relay task notices the closed channel and drops the permit.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if dispatcher.pool.with_account("a1@x", |a| a.active_requests).unwrap() == 0 {
            return;
        }
    }
    panic!("concurrency slot was not released after client disconnect");
}

#[tokio::test]
async fn orphaned_tool_result_is_rewritten_in_outbound_payload() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script("gpt-oss-120b", vec![text_success("ok")]);
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let req: MessagesRequest = serde_json::from_value(json!({
        "model": "gpt-oss-120b",
        "messages": [
            { "role": "user", "content": "go" },
            { "role": "user", "content": [
                { "type": "tool_result", "tool_use_id": "T", "content": "done" }
            ] }
        ]
    }))
    .unwrap();
    let mut ctx = dispatcher.begin_context(&req);
    dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap();

    let envelope = upstream.last_envelope();
    let text = envelope.request.contents[1].parts[0].text.as_deref().unwrap();
    assert!(text.starts_with("[Orphaned Tool Result: T]"), "got: {text}");
}

#[tokio::test]
async fn tool_schemas_are_sanitized_in_outbound_payload() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script("gpt-oss-120b", vec![text_success("ok")]);
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let req: MessagesRequest = serde_json::from_value(json!({
        "model": "gpt-oss-120b",
        "tools": [{
            "name": "t",
            "input_schema": {
                "type": "object",
                "properties": {
                    "x": {
                        "anyOf": [
                            { "type": "string" },
                            { "type": "object", "properties": { "k": { "type": "integer" } } }
                        ]
                    }
                }
            }
        }],
        "messages": [{ "role": "user", "content": "hi" }]
    }))
    .unwrap();
    let mut ctx = dispatcher.begin_context(&req);
    dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap();

    let envelope = upstream.last_envelope();
    let params = envelope.request.tools[0].function_declarations[0]
        .parameters
        .as_ref()
        .unwrap();
    let x = &params["properties"]["x"];
    assert_eq!(x["type"], "OBJECT");
    assert_eq!(x["properties"]["k"]["type"], "INTEGER");
    assert!(x["description"].as_str().unwrap().contains("Accepts: string | object"));
    assert!(x.get("anyOf").is_none());
}

#[tokio::test]
async fn bad_request_is_fatal_without_retry() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script(
        "gpt-oss-120b",
        vec![Scripted::Fail {
            status: 400,
            body: json!({ "error": { "message": "schema rejected" } }).to_string(),
        }],
    );
    let dispatcher = build(
        vec![test_account("a1@x"), test_account("a2@x")],
        upstream.clone(),
        sticky_config(),
    );

    let req = user_request("gpt-oss-120b", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    let err = dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap_err();
    assert!(matches!(err, DispatchError::BadRequest(ref m) if m == "schema rejected"));
    assert_eq!(err.http_status(), 400);
    // No endpoint walk, no account switch.
    assert_eq!(upstream.call_count(), 1);
    assert_eq!(
        dispatcher.pool.with_account("a1@x", |a| a.active_requests).unwrap(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn auth_expired_retries_same_endpoint_after_refresh() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script(
        "gpt-oss-120b",
        vec![
            Scripted::Fail { status: 401, body: String::new() },
            text_success("after refresh"),
        ],
    );
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let req = user_request("gpt-oss-120b", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    let resp = dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap();
    assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "after refresh"));
    // One failed call plus the same-endpoint retry.
    assert_eq!(upstream.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn server_errors_exhaust_retries() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script(
        "gpt-oss-120b",
        vec![Scripted::Fail { status: 503, body: "upstream down".into() }],
    );
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let req = user_request("gpt-oss-120b", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    let err = dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap_err();
    assert!(matches!(err, DispatchError::MaxRetries));
    assert_eq!(err.http_status(), 503);
    // max(3 retries, 1 account + 1) = 3 attempts × 2 endpoints.
    assert_eq!(upstream.call_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn exhausted_model_walks_fallback_chain_once() {
    let upstream = Arc::new(ScriptedUpstream::default());
    // Transient failures burn attempts without marking the account
    // rate-limited, which is the path that reaches the fallback chain.
    upstream.script(
        "gemini-2.5-pro",
        vec![Scripted::Fail { status: 503, body: "model down".into() }],
    );
    upstream.script("gemini-2.5-flash", vec![text_success("from fallback")]);
    let dispatcher = build(vec![test_account("a1@x")], upstream.clone(), sticky_config());

    let req = user_request("gemini-2.5-pro", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    let resp = dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap();

    assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "from fallback"));
    assert_eq!(ctx.resolved_model, "gemini-2.5-flash");
    assert_eq!(upstream.last_envelope().model, "gemini-2.5-flash");
    // The response still reports the model the client asked for.
    assert_eq!(resp.model, "gemini-2.5-pro");
}

#[tokio::test]
async fn sticky_session_reuses_account_across_requests() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script("gpt-oss-120b", vec![text_success("ok")]);
    let dispatcher = build(
        vec![test_account("a1@x"), test_account("a2@x"), test_account("a3@x")],
        upstream.clone(),
        sticky_config(),
    );

    // Same conversation (same first user message) twice.
    let req = user_request("gpt-oss-120b", "the very same opener");
    let mut ctx1 = dispatcher.begin_context(&req);
    dispatcher.dispatch_unary(&req, &mut ctx1).await.unwrap();

    let mut req2 = user_request("gpt-oss-120b", "the very same opener");
    req2.messages.push(Message::assistant("ok"));
    req2.messages.push(Message::user("continue"));
    let mut ctx2 = dispatcher.begin_context(&req2);
    dispatcher.dispatch_unary(&req2, &mut ctx2).await.unwrap();

    assert_eq!(ctx1.session_id, ctx2.session_id, "same opener, same session");
    let used: Vec<String> = dispatcher
        .pool
        .accounts()
        .into_iter()
        .filter(|a| a.last_used.is_some())
        .map(|a| a.email)
        .collect();
    assert_eq!(used.len(), 1, "both requests must land on the pinned account");
}

#[tokio::test]
async fn no_accounts_fails_with_service_unavailable() {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.script("gpt-oss-120b", vec![text_success("never")]);
    let dispatcher = build(vec![], upstream.clone(), sticky_config());

    let req = user_request("gpt-oss-120b", "hi");
    let mut ctx = dispatcher.begin_context(&req);
    let err = dispatcher.dispatch_unary(&req, &mut ctx).await.unwrap_err();
    assert!(matches!(err, DispatchError::NoAccounts));
    assert_eq!(err.http_status(), 503);
}
