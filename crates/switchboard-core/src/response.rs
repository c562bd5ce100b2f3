// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Response translation: upstream `generateContent` result → client
//! message format (non-streaming path).

use tracing::{debug, warn};

use switchboard_pool::SignatureCache;
use switchboard_protocol::claude::{
    is_valid_signature, ContentBlock, MediaSource, MessagesResponse, StopReason, Usage,
};
use switchboard_protocol::gemini::{
    Candidate, FinishReason, GenerateContentResponse, Part,
};
use switchboard_protocol::model_family::ModelFamily;

#[derive(Debug, Clone)]
pub struct ResponseOptions {
    /// Client-visible message id (`msg_<uuid>`).
    pub message_id: String,
    /// Client-requested model id, echoed back verbatim.
    pub model: String,
    pub session_id: String,
}

/// Translate a complete upstream response.  Signature side effects
/// (family and session caches, tool-id bindings) happen here so the
/// next turn can replay reasoning even if the client strips it.
pub fn translate_response(
    resp: &GenerateContentResponse,
    signatures: &SignatureCache,
    opts: &ResponseOptions,
) -> MessagesResponse {
    let mut out = MessagesResponse::new(opts.message_id.clone(), opts.model.clone());

    if resp.candidates.len() > 1 {
        debug!(count = resp.candidates.len(), "upstream returned multiple candidates; using the first");
    }
    let Some(candidate) = resp.candidates.first() else {
        warn!("upstream response has no candidates");
        out.stop_reason = Some(StopReason::EndTurn);
        out.usage = map_usage(resp);
        return out;
    };

    if matches!(
        candidate.finish_reason,
        Some(FinishReason::Safety) | Some(FinishReason::Recitation)
    ) {
        out.content = vec![blocked_text(candidate)];
        out.stop_reason = Some(StopReason::EndTurn);
        out.usage = map_usage(resp);
        return out;
    }

    let family = ModelFamily::of(&opts.model);
    let mut saw_tool_call = false;

    if let Some(content) = &candidate.content {
        for part in &content.parts {
            if let Some(block) = translate_part(part, signatures, family, opts, &mut saw_tool_call)
            {
                out.content.push(block);
            }
        }
    }

    if let Some(grounding) = &candidate.grounding_metadata {
        if let Some(block) = grounding_block(grounding) {
            out.content.push(block);
        }
    }

    out.stop_reason = Some(map_stop_reason(candidate.finish_reason, saw_tool_call));
    out.usage = map_usage(resp);
    out
}

fn translate_part(
    part: &Part,
    signatures: &SignatureCache,
    family: ModelFamily,
    opts: &ResponseOptions,
    saw_tool_call: &mut bool,
) -> Option<ContentBlock> {
    // Reasoning part: text with the thought flag.
    if part.thought {
        let signature = part
            .thought_signature
            .as_deref()
            .filter(|s| is_valid_signature(s))
            .map(str::to_string);
        if let Some(sig) = &signature {
            cache_signature(signatures, sig, family, &opts.session_id);
        }
        let text = part.text.clone().unwrap_or_default();
        if text.is_empty() {
            // Signature without visible reasoning: preserve it opaquely.
            return signature.map(|data| ContentBlock::RedactedThinking { data });
        }
        return Some(ContentBlock::Thinking { thinking: text, signature });
    }

    if let Some(call) = &part.function_call {
        *saw_tool_call = true;
        let id = call
            .id
            .clone()
            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
        if let Some(sig) = part.thought_signature.as_deref().filter(|s| is_valid_signature(s)) {
            signatures.cache_tool_signature(&id, sig);
            cache_signature(signatures, sig, family, &opts.session_id);
        }
        return Some(ContentBlock::ToolUse {
            id,
            name: call.name.clone(),
            input: call.args.clone(),
        });
    }

    if let Some(blob) = &part.inline_data {
        return Some(ContentBlock::Image {
            source: MediaSource::Base64 {
                media_type: blob.mime_type.clone(),
                data: blob.data.clone(),
            },
        });
    }

    if let Some(file) = &part.file_data {
        let source = MediaSource::Url { url: file.file_uri.clone() };
        return Some(if file.mime_type.starts_with("image/") {
            ContentBlock::Image { source }
        } else {
            ContentBlock::Document { source }
        });
    }

    match part.text.as_deref() {
        Some(text) if !text.is_empty() => Some(ContentBlock::Text { text: text.to_string() }),
        _ => None,
    }
}

fn cache_signature(
    signatures: &SignatureCache,
    sig: &str,
    family: ModelFamily,
    session_id: &str,
) {
    if let Some(fam) = family.signature_family() {
        signatures.cache_signature_family(sig, &format!("{fam:?}").to_lowercase());
    }
    signatures.cache_session_signature(session_id, sig);
}

fn blocked_text(candidate: &Candidate) -> ContentBlock {
    let categories = candidate
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
        .unwrap_or_else(|| "unspecified".into());
    ContentBlock::Text {
        text: format!("[Content blocked by safety filter: {categories}]"),
    }
}

fn grounding_block(
    grounding: &switchboard_protocol::gemini::GroundingMetadata,
) -> Option<ContentBlock> {
    let mut lines = Vec::new();
    if !grounding.web_search_queries.is_empty() {
        lines.push(format!(
            "Search queries: {}",
            grounding.web_search_queries.join(", ")
        ));
    }
    let sources: Vec<String> = grounding
        .grounding_chunks
        .iter()
        .filter_map(|c| c.web.as_ref())
        .map(|w| w.uri.clone())
        .collect();
    if !sources.is_empty() {
        lines.push(format!("Sources: {}", sources.join(", ")));
    }
    (!lines.is_empty()).then(|| ContentBlock::Text { text: lines.join("\n") })
}

pub(crate) fn map_stop_reason(finish: Option<FinishReason>, saw_tool_call: bool) -> StopReason {
    if saw_tool_call {
        return StopReason::ToolUse;
    }
    match finish {
        Some(FinishReason::MaxTokens) => StopReason::MaxTokens,
        Some(FinishReason::ToolUse) => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

pub(crate) fn map_usage(resp: &GenerateContentResponse) -> Usage {
    let Some(meta) = &resp.usage_metadata else { return Usage::default() };
    Usage {
        input_tokens: meta.prompt_token_count.saturating_sub(meta.cached_content_token_count),
        output_tokens: meta.candidates_token_count,
        cache_read_input_tokens: meta.cached_content_token_count,
        cache_creation_input_tokens: 0,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
