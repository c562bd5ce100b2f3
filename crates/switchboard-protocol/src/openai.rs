// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible chat format (`/v1/chat/completions`).
//!
//! Requests in this format are translated to the native message format
//! before dispatch, and responses are translated back.  Only the widely
//! used subset is supported: `model`, `messages`, `stream`,
//! `max_tokens`, `temperature`, `top_p`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::claude::{
    ContentBlock, Message, MessagesRequest, MessagesResponse, StopReason, SystemPrompt,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Plain string, or the multi-part array some clients send.
    #[serde(default)]
    pub content: Value,
}

impl ChatMessage {
    /// Flatten string-or-parts content to plain text.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

/// Translate an OpenAI-style request into the native format.  System
/// messages collapse into the `system` field; consecutive roles are
/// preserved as-is (the request translator normalises ordering later).
pub fn to_messages_request(req: ChatCompletionRequest) -> MessagesRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for m in &req.messages {
        match m.role.as_str() {
            "system" | "developer" => system_parts.push(m.text()),
            "assistant" => messages.push(Message::assistant(m.text())),
            // "user", "tool", and anything unrecognised map to the user role.
            _ => messages.push(Message::user(m.text())),
        }
    }

    MessagesRequest {
        model: req.model,
        messages,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(SystemPrompt::Text(system_parts.join("\n\n")))
        },
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        stop_sequences: Vec::new(),
        tools: Vec::new(),
        tool_choice: None,
        thinking: None,
        stream: req.stream,
        metadata: None,
    }
}

// ─── Response ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: ChatUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponseMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

pub fn finish_reason(stop: Option<StopReason>) -> Option<String> {
    stop.map(|s| {
        match s {
            StopReason::EndTurn | StopReason::StopSequence => "stop",
            StopReason::MaxTokens => "length",
            StopReason::ToolUse => "tool_calls",
        }
        .to_string()
    })
}

/// Translate a native response into OpenAI-compatible shape.  Reasoning
/// blocks are dropped (this surface has no place for them); tool calls
/// are not exposed on this surface either, so only text survives.
pub fn from_messages_response(resp: &MessagesResponse, created: u64) -> ChatCompletionResponse {
    let content: String = resp
        .content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    ChatCompletionResponse {
        id: resp.id.clone(),
        object: "chat.completion".into(),
        created,
        model: resp.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage { role: "assistant".into(), content },
            finish_reason: finish_reason(resp.stop_reason),
        }],
        usage: ChatUsage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        },
    }
}

// ─── Streaming chunks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    fn base(id: &str, model: &str, created: u64, delta: ChunkDelta, finish: Option<String>) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".into(),
            created,
            model: model.into(),
            choices: vec![ChunkChoice { index: 0, delta, finish_reason: finish }],
        }
    }

    /// First chunk of a stream: announces the assistant role.
    pub fn role(id: &str, model: &str, created: u64) -> Self {
        Self::base(
            id,
            model,
            created,
            ChunkDelta { role: Some("assistant".into()), content: None },
            None,
        )
    }

    /// Text (or reasoning) delta chunk.
    pub fn content(id: &str, model: &str, created: u64, text: &str) -> Self {
        Self::base(
            id,
            model,
            created,
            ChunkDelta { role: None, content: Some(text.into()) },
            None,
        )
    }

    /// Terminal chunk carrying the finish reason.
    pub fn finish(id: &str, model: &str, created: u64, stop: Option<StopReason>) -> Self {
        Self::base(
            id,
            model,
            created,
            ChunkDelta::default(),
            finish_reason(stop).or_else(|| Some("stop".into())),
        )
    }
}

// ─── Model list ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

impl ModelList {
    pub fn new(ids: Vec<String>, created: u64) -> Self {
        Self {
            object: "list".into(),
            data: ids
                .into_iter()
                .map(|id| ModelEntry {
                    id,
                    object: "model".into(),
                    created,
                    owned_by: "switchboard".into(),
                })
                .collect(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
