// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire formats for the proxy: the client-facing message format, the
//! OpenAI-compatible compatibility surface, and the upstream
//! `generateContent` dialect, plus the schema sanitizer and per-family
//! capability tables shared by the translators.

pub mod claude;
pub mod gemini;
pub mod model_family;
pub mod openai;
pub mod sanitize;

pub use claude::{
    is_valid_signature, ApiError, ContentBlock, Delta, Message, MessageContent, MessageDeltaBody,
    MessagesRequest, MessagesResponse, Role, StopReason, StreamEvent, SystemPrompt, ThinkingConfig,
    ThinkingLevel, Tool, ToolChoice, ToolResultContent, Usage, MIN_SIGNATURE_LEN,
};
pub use model_family::{ModelFamily, SignatureFamily};
