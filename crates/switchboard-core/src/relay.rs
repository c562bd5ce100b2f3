// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming relay: upstream SSE frames → client stream events.
//!
//! The relay is a single-reader state machine per connection.  It
//! tracks the currently open content block, assigns strictly increasing
//! block indices, accumulates usage metadata, and guarantees the client
//! event grammar: `message_start`, then for each block
//! `content_block_start` → deltas → `content_block_stop`, then
//! `message_delta` + `message_stop`.  A reasoning block's signature is
//! emitted as a `signature_delta` immediately before the block closes.

use serde_json::Value;
use tracing::debug;

use switchboard_pool::SignatureCache;
use switchboard_protocol::claude::{
    is_valid_signature, ApiError, ContentBlock, Delta, MessagesResponse, StreamEvent, Usage,
};
use switchboard_protocol::gemini::{FinishReason, GenerateContentResponse, Part};
use switchboard_protocol::model_family::ModelFamily;

/// What kind of block is currently open on the client side.
#[derive(Debug, Clone, PartialEq)]
enum OpenBlock {
    Text,
    Thinking { signature: Option<String> },
    ToolUse { id: String },
}

pub struct SseRelay {
    message_id: String,
    model: String,
    session_id: String,
    family: ModelFamily,

    started: bool,
    next_index: usize,
    open: Option<OpenBlock>,
    usage: Usage,
    finish: Option<FinishReason>,
    saw_tool_call: bool,
    blocked_categories: Option<String>,
}

impl SseRelay {
    pub fn new(message_id: String, model: String, session_id: String) -> Self {
        let family = ModelFamily::of(&model);
        Self {
            message_id,
            model,
            session_id,
            family,
            started: false,
            next_index: 0,
            open: None,
            usage: Usage::default(),
            finish: None,
            saw_tool_call: false,
            blocked_categories: None,
        }
    }

    /// Accumulated usage so far (for session token accounting).
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Feed one upstream SSE frame; returns the client events it
    /// produces, in order.
    pub fn on_frame(
        &mut self,
        frame: &Value,
        signatures: &SignatureCache,
    ) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);

        let Ok(resp) = GenerateContentResponse::from_json(frame.clone()) else {
            debug!("ignoring unparseable upstream frame");
            return events;
        };

        if let Some(meta) = &resp.usage_metadata {
            self.usage.input_tokens = meta
                .prompt_token_count
                .saturating_sub(meta.cached_content_token_count);
            self.usage.output_tokens = meta.candidates_token_count;
            self.usage.cache_read_input_tokens = meta.cached_content_token_count;
        }

        let Some(candidate) = resp.candidates.first() else {
            return events;
        };
        if let Some(reason) = candidate.finish_reason {
            self.finish = Some(reason);
            if matches!(reason, FinishReason::Safety | FinishReason::Recitation) {
                self.blocked_categories = Some(
                    candidate
                        .safety_ratings
                        .as_ref()
                        .and_then(|r| r.as_array())
                        .map(|ratings| {
                            ratings
                                .iter()
                                .filter_map(|r| r["category"].as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "unspecified".into()),
                );
            }
        }

        if let Some(content) = &candidate.content {
            for part in &content.parts {
                self.on_part(part, signatures, &mut events);
            }
        }
        events
    }

    fn on_part(
        &mut self,
        part: &Part,
        signatures: &SignatureCache,
        events: &mut Vec<StreamEvent>,
    ) {
        if part.thought {
            let text = part.text.as_deref().unwrap_or_default();
            if !matches!(self.open, Some(OpenBlock::Thinking { .. })) {
                self.close_open(events);
                events.push(StreamEvent::ContentBlockStart {
                    index: self.next_index,
                    content_block: ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                });
                self.open = Some(OpenBlock::Thinking { signature: None });
            }
            if !text.is_empty() {
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.next_index,
                    delta: Delta::ThinkingDelta { thinking: text.to_string() },
                });
            }
            if let Some(sig) = part.thought_signature.as_deref().filter(|s| is_valid_signature(s))
            {
                self.cache_signature(signatures, sig);
                if let Some(OpenBlock::Thinking { signature }) = &mut self.open {
                    *signature = Some(sig.to_string());
                }
            }
            return;
        }

        if let Some(call) = &part.function_call {
            self.close_open(events);
            self.saw_tool_call = true;
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
            if let Some(sig) =
                part.thought_signature.as_deref().filter(|s| is_valid_signature(s))
            {
                signatures.cache_tool_signature(&id, sig);
                self.cache_signature(signatures, sig);
            }
            events.push(StreamEvent::ContentBlockStart {
                index: self.next_index,
                content_block: ContentBlock::ToolUse {
                    id: id.clone(),
                    name: call.name.clone(),
                    input: serde_json::json!({}),
                },
            });
            let args = call.args.to_string();
            for fragment in split_json_fragments(&args) {
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.next_index,
                    delta: Delta::InputJsonDelta { partial_json: fragment },
                });
            }
            self.open = Some(OpenBlock::ToolUse { id });
            // Tool-call arguments arrive complete per part; close the
            // block immediately so the next block can open.
            self.close_open(events);
            return;
        }

        if let Some(text) = part.text.as_deref() {
            if text.is_empty() {
                return;
            }
            if !matches!(self.open, Some(OpenBlock::Text)) {
                self.close_open(events);
                events.push(StreamEvent::ContentBlockStart {
                    index: self.next_index,
                    content_block: ContentBlock::Text { text: String::new() },
                });
                self.open = Some(OpenBlock::Text);
            }
            events.push(StreamEvent::ContentBlockDelta {
                index: self.next_index,
                delta: Delta::TextDelta { text: text.to_string() },
            });
        }
    }

    fn cache_signature(&self, signatures: &SignatureCache, sig: &str) {
        if let Some(fam) = self.family.signature_family() {
            signatures.cache_signature_family(sig, &format!("{fam:?}").to_lowercase());
        }
        signatures.cache_session_signature(&self.session_id, sig);
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: MessagesResponse::new(self.message_id.clone(), self.model.clone()),
        });
    }

    /// Close the currently open block, emitting a trailing
    /// `signature_delta` for reasoning blocks that collected one.
    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        let Some(open) = self.open.take() else { return };
        if let OpenBlock::Thinking { signature: Some(sig) } = &open {
            events.push(StreamEvent::ContentBlockDelta {
                index: self.next_index,
                delta: Delta::SignatureDelta { signature: sig.clone() },
            });
        }
        events.push(StreamEvent::ContentBlockStop { index: self.next_index });
        self.next_index += 1;
    }

    /// Terminal events after the upstream stream ends.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);

        if let Some(categories) = self.blocked_categories.take() {
            events.push(StreamEvent::ContentBlockStart {
                index: self.next_index,
                content_block: ContentBlock::Text { text: String::new() },
            });
            events.push(StreamEvent::ContentBlockDelta {
                index: self.next_index,
                delta: Delta::TextDelta {
                    text: format!("[Content blocked by safety filter: {categories}]"),
                },
            });
            self.open = Some(OpenBlock::Text);
        }

        self.close_open(&mut events);

        let stop_reason = crate::response::map_stop_reason(self.finish, self.saw_tool_call);
        events.push(StreamEvent::MessageDelta {
            delta: switchboard_protocol::claude::MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self.usage.clone(),
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    /// Error after the stream started: the HTTP status is already on
    /// the wire, so the failure is surfaced as an `error` event.
    pub fn error(&mut self, kind: &str, message: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        self.close_open(&mut events);
        events.push(StreamEvent::Error {
            error: ApiError { kind: kind.to_string(), message: message.to_string() },
        });
        events
    }
}

/// Split serialized tool-call arguments into client-sized JSON
/// fragments.  Splits after each top-level-ish `:` outside string
/// literals, which yields small, concatenation-safe chunks.
pub(crate) fn split_json_fragments(json: &str) -> Vec<String> {
    if json.is_empty() || json == "null" {
        return vec!["{}".into()];
    }
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in json.chars() {
        current.push(c);
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ':' if !in_string => {
                fragments.push(std::mem::take(&mut current));
            }
            _ => {}
        }
    }
    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchboard_protocol::claude::StopReason;

    fn relay() -> SseRelay {
        SseRelay::new("msg_1".into(), "gemini-3-pro-preview".into(), "sess".into())
    }

    fn sig() -> String {
        "g".repeat(40)
    }

    fn text_frame(text: &str) -> Value {
        json!({
            "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }]
        })
    }

    fn event_names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_name()).collect()
    }

    #[test]
    fn first_frame_emits_message_start_then_block() {
        let mut r = relay();
        let cache = SignatureCache::new();
        let events = r.on_frame(&text_frame("hel"), &cache);
        assert_eq!(
            event_names(&events),
            vec!["message_start", "content_block_start", "content_block_delta"]
        );
    }

    #[test]
    fn consecutive_text_frames_share_one_block() {
        let mut r = relay();
        let cache = SignatureCache::new();
        r.on_frame(&text_frame("hel"), &cache);
        let events = r.on_frame(&text_frame("lo"), &cache);
        assert_eq!(event_names(&events), vec!["content_block_delta"]);
    }

    #[test]
    fn finish_closes_block_and_emits_terminal_events() {
        let mut r = relay();
        let cache = SignatureCache::new();
        r.on_frame(&text_frame("hello"), &cache);
        r.on_frame(
            &json!({
                "candidates": [{ "finishReason": "STOP" }],
                "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 1 }
            }),
            &cache,
        );
        let events = r.finish();
        assert_eq!(
            event_names(&events),
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
        match &events[1] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.input_tokens, 5);
                assert_eq!(usage.output_tokens, 1);
            }
            other => panic!("expected MessageDelta, got {other:?}"),
        }
    }

    #[test]
    fn reasoning_then_tool_call_matches_expected_grammar() {
        let mut r = relay();
        let cache = SignatureCache::new();
        let mut trace: Vec<StreamEvent> = Vec::new();

        trace.extend(r.on_frame(
            &json!({
                "candidates": [{ "content": { "role": "model", "parts": [
                    { "text": "thinking a", "thought": true }
                ] } }]
            }),
            &cache,
        ));
        trace.extend(r.on_frame(
            &json!({
                "candidates": [{ "content": { "role": "model", "parts": [
                    { "text": "thinking b", "thought": true, "thoughtSignature": sig() }
                ] } }]
            }),
            &cache,
        ));
        trace.extend(r.on_frame(
            &json!({
                "candidates": [{
                    "content": { "role": "model", "parts": [
                        { "functionCall": { "name": "t", "args": { "q": "x" } }, "thoughtSignature": sig() }
                    ] },
                    "finishReason": "STOP"
                }]
            }),
            &cache,
        ));
        trace.extend(r.finish());

        let names = event_names(&trace);
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",   // reasoning (index 0)
                "content_block_delta",   // thinking_delta a
                "content_block_delta",   // thinking_delta b
                "content_block_delta",   // signature_delta
                "content_block_stop",    // index 0
                "content_block_start",   // tool call (index 1)
                "content_block_delta",   // input_json_delta "{"q":"
                "content_block_delta",   // input_json_delta ""x"}"
                "content_block_stop",    // index 1
                "message_delta",
                "message_stop",
            ]
        );

        // Indices strictly increase and the signature precedes the stop.
        match &trace[4] {
            StreamEvent::ContentBlockDelta { index: 0, delta: Delta::SignatureDelta { signature } } => {
                assert_eq!(signature, &sig());
            }
            other => panic!("expected signature_delta at index 0, got {other:?}"),
        }
        match (&trace[7], &trace[8]) {
            (
                StreamEvent::ContentBlockDelta { index: 1, delta: Delta::InputJsonDelta { partial_json: a } },
                StreamEvent::ContentBlockDelta { index: 1, delta: Delta::InputJsonDelta { partial_json: b } },
            ) => {
                assert_eq!(format!("{a}{b}"), "{\"q\":\"x\"}");
            }
            other => panic!("expected two json fragments, got {other:?}"),
        }
        match trace.last().unwrap() {
            StreamEvent::MessageStop => {}
            other => panic!("expected message_stop, got {other:?}"),
        }

        // Terminal stop reason reflects the tool call.
        let delta = trace.iter().find_map(|e| match e {
            StreamEvent::MessageDelta { delta, .. } => Some(delta),
            _ => None,
        });
        assert_eq!(delta.unwrap().stop_reason, Some(StopReason::ToolUse));

        // Signature cached under the tool-call id.
        let cached = cache.tool_signature(
            trace
                .iter()
                .find_map(|e| match e {
                    StreamEvent::ContentBlockStart {
                        content_block: ContentBlock::ToolUse { id, .. },
                        ..
                    } => Some(id.as_str()),
                    _ => None,
                })
                .unwrap(),
        );
        assert_eq!(cached.as_deref(), Some(sig().as_str()));
    }

    #[test]
    fn error_after_start_emits_error_event() {
        let mut r = relay();
        let cache = SignatureCache::new();
        r.on_frame(&text_frame("partial"), &cache);
        let events = r.error("overloaded_error", "upstream disconnected");
        assert_eq!(event_names(&events), vec!["content_block_stop", "error"]);
        match events.last().unwrap() {
            StreamEvent::Error { error } => {
                assert_eq!(error.kind, "overloaded_error");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn safety_block_surfaces_text_before_stop() {
        let mut r = relay();
        let cache = SignatureCache::new();
        r.on_frame(
            &json!({
                "candidates": [{
                    "finishReason": "SAFETY",
                    "safetyRatings": [{ "category": "HARM_X" }]
                }]
            }),
            &cache,
        );
        let events = r.finish();
        let text = events.iter().find_map(|e| match e {
            StreamEvent::ContentBlockDelta { delta: Delta::TextDelta { text }, .. } => Some(text),
            _ => None,
        });
        assert!(text.unwrap().contains("HARM_X"));
    }

    #[test]
    fn split_json_fragments_reassemble() {
        for case in [
            r#"{"q":"x"}"#,
            r#"{"a":1,"b":{"c":"with : colon"}}"#,
            r#"{"esc":"quote \" and : inside"}"#,
            "{}",
        ] {
            let joined = split_json_fragments(case).join("");
            assert_eq!(joined, case);
        }
    }

    #[test]
    fn split_json_fragments_splits_after_colons() {
        let frags = split_json_fragments(r#"{"q":"x"}"#);
        assert_eq!(frags, vec!["{\"q\":", "\"x\"}"]);
    }

    #[test]
    fn empty_args_become_empty_object() {
        assert_eq!(split_json_fragments("null"), vec!["{}"]);
    }
}
