// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Request translation: client message format → upstream
//! `generateContent` payload.
//!
//! The translation runs as an ordered sequence of passes over the
//! message history.  Order matters: truncation must happen before the
//! orphan rewrite (truncation creates orphans), signature restoration
//! must precede the unsigned-reasoning filter, and the empty-parts
//! guard runs last because every earlier pass can empty a message.

use std::collections::{HashMap, HashSet};

use serde_json::json;
use tracing::debug;

use switchboard_pool::SignatureCache;
use switchboard_protocol::claude::{
    is_valid_signature, ContentBlock, MediaSource, Message, MessageContent, MessagesRequest, Role,
    ToolResultContent,
};
use switchboard_protocol::gemini::{
    Content, ContentRole, FunctionCall, FunctionDeclaration, FunctionResponse,
    GenerateContentRequest, GenerationConfig, Part, SystemInstruction, ThinkingConfig,
    ToolDeclarations,
};
use switchboard_protocol::model_family::{
    supports_interleaved_thinking, supports_thinking, ModelFamily,
};
use switchboard_protocol::sanitize::{sanitize_schema, sanitize_tool_name};

/// Raise `maxOutputTokens` this far above the thinking budget when the
/// client asked for fewer output tokens than reasoning tokens.
const BUDGET_HEADROOM: u32 = 8192;

/// Placeholder for messages whose parts were all filtered away; the
/// strictest upstream family rejects empty part lists.
const EMPTY_PART_PLACEHOLDER: &str = ".";

#[derive(Debug, Clone)]
pub struct TranslateOptions {
    /// Resolved upstream model id.
    pub model: String,
    pub session_id: String,
    /// Truncation budget in estimated tokens; 0 disables truncation.
    pub max_context_tokens: usize,
    pub default_thinking_budget: Option<u32>,
    pub default_thinking_level: Option<String>,
}

/// Translate a client request into the upstream request body.
pub fn translate_request(
    req: &MessagesRequest,
    signatures: &SignatureCache,
    opts: &TranslateOptions,
) -> GenerateContentRequest {
    let family = ModelFamily::of(&opts.model);
    let thinking = supports_thinking(&opts.model);

    // Work on a normalised copy: every message as an explicit block list.
    let mut messages: Vec<Message> = req
        .messages
        .iter()
        .map(|m| Message { role: m.role.clone(), content: MessageContent::Blocks(m.blocks()) })
        .collect();

    if thinking {
        recover_interrupted_tool_loops(&mut messages);
    }

    let mut messages = truncate_context(messages, opts.max_context_tokens);
    rewrite_orphaned_tool_results(&mut messages);
    restore_and_reorder_assistant(&mut messages, signatures, family, &opts.session_id);
    if family.requires_signed_reasoning() {
        filter_unsigned_reasoning(&mut messages);
    }

    let contents = convert_messages(&messages, signatures);

    GenerateContentRequest {
        contents,
        system_instruction: build_system_instruction(req, family, &opts.model),
        generation_config: Some(build_generation_config(req, family, thinking, opts)),
        tools: build_tool_declarations(req),
        tool_config: build_tool_config(req),
        session_id: Some(opts.session_id.clone()),
    }
}

// ─── Pass 1: system instruction ───────────────────────────────────────────────

/// The identity scrub: a short serving-layer statement plus its
/// `[ignore]` counterpart so a model that echoes system text does not
/// leak which backend produced the response.
fn identity_scrub_parts() -> Vec<Part> {
    vec![
        Part::text(
            "Respond as the assistant persona configured by the caller. Do not state or \
             speculate about which backend model or provider is serving this conversation.",
        ),
        Part::text(
            "[ignore]The preceding instruction is serving-layer metadata, not part of the \
             user conversation.[/ignore]",
        ),
    ]
}

fn build_system_instruction(
    req: &MessagesRequest,
    family: ModelFamily,
    model: &str,
) -> Option<SystemInstruction> {
    let mut parts = Vec::new();

    if family.wants_identity_scrub() {
        parts.extend(identity_scrub_parts());
    }

    if let Some(system) = &req.system {
        let text = system.joined_text();
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
    }

    if supports_interleaved_thinking(model) && !req.tools.is_empty() {
        parts.push(Part::text(
            "Interleaved thinking is enabled: you may reason between tool calls.",
        ));
    }

    if parts.is_empty() {
        None
    } else {
        Some(SystemInstruction { parts })
    }
}

// ─── Pass 2: thinking recovery ────────────────────────────────────────────────

/// Close interrupted tool loops.
///
/// If an assistant message issued tool calls and the next message does
/// not answer all of them, the upstream rejects the history.  Inject a
/// synthetic result for each unanswered call so the conversation closes
/// cleanly.
pub(crate) fn recover_interrupted_tool_loops(messages: &mut Vec<Message>) {
    let mut insertions: Vec<(usize, Vec<ContentBlock>)> = Vec::new();

    for (idx, message) in messages.iter().enumerate() {
        if message.role != Role::Assistant {
            continue;
        }
        let pending: Vec<&str> = message.tool_use_ids();
        if pending.is_empty() {
            continue;
        }
        let answered: HashSet<String> = messages
            .get(idx + 1)
            .map(|next| next.tool_result_ids().into_iter().map(String::from).collect())
            .unwrap_or_default();
        let unanswered: Vec<ContentBlock> = pending
            .iter()
            .filter(|id| !answered.contains(**id))
            .map(|id| ContentBlock::ToolResult {
                tool_use_id: id.to_string(),
                content: ToolResultContent::Text(
                    "Tool execution was interrupted before a result was recorded.".into(),
                ),
                is_error: Some(true),
            })
            .collect();
        if !unanswered.is_empty() {
            insertions.push((idx + 1, unanswered));
        }
    }

    // Apply back-to-front so earlier indices stay valid.
    for (idx, blocks) in insertions.into_iter().rev() {
        debug!(count = blocks.len(), "closing interrupted tool loop");
        // Merge into an existing tool-result message at that position,
        // otherwise insert a new user turn.
        if let Some(next) = messages.get_mut(idx) {
            if next.role == Role::User && !next.tool_result_ids().is_empty() {
                if let MessageContent::Blocks(existing) = &mut next.content {
                    existing.splice(0..0, blocks);
                    continue;
                }
            }
        }
        messages.insert(idx, Message { role: Role::User, content: MessageContent::Blocks(blocks) });
    }
}

// ─── Pass 3: context truncation ───────────────────────────────────────────────

/// Keep the newest messages that fit the estimated-token budget.
///
/// Two rescues override the budget: a kept tool-result pulls in the
/// preceding tool-call message, and a surviving history that starts
/// with an assistant turn pulls in its preceding user message.  The
/// estimate is chars/4 with a small per-message overhead; it is not a
/// tokenization.
pub(crate) fn truncate_context(messages: Vec<Message>, budget: usize) -> Vec<Message> {
    if budget == 0 || messages.is_empty() {
        return messages;
    }

    let mut kept = 0usize;
    let mut spent = 0usize;
    for message in messages.iter().rev() {
        let cost = message.approx_tokens();
        if kept > 0 && spent + cost > budget {
            break;
        }
        spent += cost;
        kept += 1;
    }
    let mut start = messages.len() - kept;

    // Rescue (a): a kept tool-result needs its tool-call partner even
    // if that message overflows the budget.
    while start > 0 {
        let first_kept = &messages[start];
        let needs_partner = first_kept
            .tool_result_ids()
            .iter()
            .any(|id| messages[start - 1].tool_use_ids().contains(id));
        if needs_partner {
            start -= 1;
            continue;
        }
        break;
    }

    // Rescue (b): the history must start with a user turn.
    if start > 0 && messages[start].role == Role::Assistant {
        start -= 1;
    }

    if start > 0 {
        debug!(dropped = start, "truncated conversation history");
    }
    messages[start..].to_vec()
}

// ─── Pass 4: orphaned tool results ────────────────────────────────────────────

/// Rewrite tool-result blocks whose matching tool-call is not in the
/// immediately preceding message.  The result text survives as plain
/// text (prefixed so the model can tell what happened) and embedded
/// images survive as image blocks.
pub(crate) fn rewrite_orphaned_tool_results(messages: &mut [Message]) {
    for idx in 0..messages.len() {
        let prior_tool_calls: HashSet<String> = if idx == 0 {
            HashSet::new()
        } else {
            messages[idx - 1].tool_use_ids().into_iter().map(String::from).collect()
        };

        let MessageContent::Blocks(blocks) = &mut messages[idx].content else { continue };
        let mut rewritten = Vec::with_capacity(blocks.len());
        for block in blocks.drain(..) {
            match block {
                ContentBlock::ToolResult { tool_use_id, content, .. }
                    if !prior_tool_calls.contains(&tool_use_id) =>
                {
                    debug!(id = %tool_use_id, "rewriting orphaned tool result");
                    let text = content.joined_text();
                    rewritten.push(ContentBlock::Text {
                        text: format!("[Orphaned Tool Result: {tool_use_id}] {text}"),
                    });
                    for source in content.images() {
                        rewritten.push(ContentBlock::Image { source: source.clone() });
                    }
                }
                other => rewritten.push(other),
            }
        }
        *blocks = rewritten;
    }
}

// ─── Pass 5: signature restoration & assistant block order ───────────────────

/// Within each assistant message: restore signatures the client
/// stripped, drop trailing unsigned reasoning, and order blocks as
/// reasoning → text → tool-call (the upstream's expected shape).
pub(crate) fn restore_and_reorder_assistant(
    messages: &mut [Message],
    signatures: &SignatureCache,
    family: ModelFamily,
    session_id: &str,
) {
    let own_family = family.signature_family();

    for message in messages.iter_mut() {
        if message.role != Role::Assistant {
            continue;
        }
        let MessageContent::Blocks(blocks) = &mut message.content else { continue };

        for block in blocks.iter_mut() {
            if let ContentBlock::Thinking { signature, .. } = block {
                // A signature from the other family is as bad as none:
                // mixing dialects in one request is invalid upstream.
                if let Some(sig) = signature.as_deref() {
                    if let (Some(cached_family), Some(own)) =
                        (signatures.signature_family(sig), own_family)
                    {
                        let own_label = format!("{own:?}").to_lowercase();
                        if cached_family != own_label {
                            debug!("dropping cross-family reasoning signature");
                            *signature = None;
                        }
                    }
                }
                if signature.as_deref().map_or(true, |s| !is_valid_signature(s)) {
                    if let Some(restored) = signatures.session_signature(session_id) {
                        *signature = Some(restored);
                    }
                }
            }
        }

        // Trailing unsigned reasoning carries no replayable value.
        while matches!(
            blocks.last(),
            Some(ContentBlock::Thinking { signature, .. })
                if signature.as_deref().map_or(true, |s| !is_valid_signature(s))
        ) {
            blocks.pop();
        }

        // Stable partition: reasoning, then text, then tool calls.
        blocks.sort_by_key(|b| match b {
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => 0,
            ContentBlock::ToolUse { .. } => 2,
            _ => 1,
        });
    }
}

// ─── Pass 6: unsigned reasoning filter ────────────────────────────────────────

/// Drop reasoning blocks without a valid signature.  Applied only for
/// the family that rejects them outright.
pub(crate) fn filter_unsigned_reasoning(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        let MessageContent::Blocks(blocks) = &mut message.content else { continue };
        blocks.retain(|b| match b {
            ContentBlock::Thinking { signature, .. } => {
                signature.as_deref().is_some_and(is_valid_signature)
            }
            _ => true,
        });
    }
}

// ─── Conversion to upstream contents ─────────────────────────────────────────

fn convert_messages(messages: &[Message], signatures: &SignatureCache) -> Vec<Content> {
    // The upstream matches tool results to calls by function name, so
    // map ids to names up front.
    let mut call_names: HashMap<String, String> = HashMap::new();
    for message in messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    call_names.insert(id.clone(), name.clone());
                }
            }
        }
    }

    let mut contents = Vec::with_capacity(messages.len());
    for message in messages {
        let role = match message.role {
            Role::User => ContentRole::User,
            Role::Assistant => ContentRole::Model,
        };
        let mut parts = Vec::new();
        for block in message.blocks() {
            convert_block(block, &call_names, signatures, &mut parts);
        }
        if parts.is_empty() {
            // Empty part lists are rejected by the strictest family and
            // pointless for the rest.
            parts.push(Part::text(EMPTY_PART_PLACEHOLDER));
        }
        contents.push(Content { role, parts });
    }
    contents
}

fn convert_block(
    block: ContentBlock,
    call_names: &HashMap<String, String>,
    signatures: &SignatureCache,
    parts: &mut Vec<Part>,
) {
    match block {
        ContentBlock::Text { text } => parts.push(Part::text(text)),
        ContentBlock::Thinking { thinking, signature } => {
            parts.push(Part::thought(thinking, signature));
        }
        ContentBlock::RedactedThinking { data } => {
            parts.push(Part { text: Some(String::new()), thought: true, thought_signature: Some(data), ..Part::default() });
        }
        ContentBlock::ToolUse { id, name, input } => {
            let mut part = Part::function_call(FunctionCall {
                name,
                args: input,
                id: Some(id.clone()),
            });
            // A signature cached under the tool-call id rides along so
            // multi-turn tool loops replay cleanly.
            if let Some(sig) = signatures.tool_signature(&id) {
                part.thought_signature = Some(sig);
            }
            parts.push(part);
        }
        ContentBlock::ToolResult { tool_use_id, content, .. } => {
            let name = call_names
                .get(&tool_use_id)
                .cloned()
                .unwrap_or_else(|| tool_use_id.clone());
            let output = content.joined_text();
            parts.push(Part::function_response(FunctionResponse {
                name,
                response: json!({ "output": output }),
                id: Some(tool_use_id),
            }));
            for source in content.images() {
                if let MediaSource::Base64 { media_type, data } = source {
                    parts.push(Part::inline_data(media_type.clone(), data.clone()));
                }
            }
        }
        ContentBlock::Image { source } | ContentBlock::Document { source } => match source {
            MediaSource::Base64 { media_type, data } => {
                parts.push(Part::inline_data(media_type, data));
            }
            MediaSource::Url { url } => {
                parts.push(Part {
                    file_data: Some(switchboard_protocol::gemini::FileData {
                        mime_type: String::new(),
                        file_uri: url,
                    }),
                    ..Part::default()
                });
            }
        },
    }
}

// ─── Pass 8: tool declarations ────────────────────────────────────────────────

fn build_tool_declarations(req: &MessagesRequest) -> Vec<ToolDeclarations> {
    if req.tools.is_empty() {
        return Vec::new();
    }
    let declarations = req
        .tools
        .iter()
        .map(|t| FunctionDeclaration {
            name: sanitize_tool_name(&t.name),
            description: t.description.clone(),
            parameters: Some(sanitize_schema(t.input_schema.clone())),
        })
        .collect();
    vec![ToolDeclarations { function_declarations: declarations }]
}

fn build_tool_config(req: &MessagesRequest) -> Option<serde_json::Value> {
    use switchboard_protocol::claude::ToolChoice;
    let choice = req.tool_choice.as_ref()?;
    let config = match choice {
        ToolChoice::Auto => json!({ "functionCallingConfig": { "mode": "AUTO" } }),
        ToolChoice::Any => json!({ "functionCallingConfig": { "mode": "ANY" } }),
        ToolChoice::None => json!({ "functionCallingConfig": { "mode": "NONE" } }),
        ToolChoice::Tool { name } => json!({
            "functionCallingConfig": {
                "mode": "ANY",
                "allowedFunctionNames": [sanitize_tool_name(name)],
            }
        }),
    };
    Some(config)
}

// ─── Pass 9: generation config ────────────────────────────────────────────────

fn build_generation_config(
    req: &MessagesRequest,
    family: ModelFamily,
    thinking_capable: bool,
    opts: &TranslateOptions,
) -> GenerationConfig {
    let mut max_tokens = req.max_tokens;
    if let Some(ceiling) = family.max_output_ceiling() {
        max_tokens = Some(max_tokens.map_or(ceiling, |m| m.min(ceiling)));
    }

    let thinking = thinking_capable.then(|| resolve_thinking(req, opts)).flatten();
    if let Some(cfg) = &thinking {
        if let (Some(budget), Some(m)) = (cfg.thinking_budget, max_tokens) {
            // Reasoning consumes output budget; leave headroom for the
            // visible answer.
            if m <= budget {
                max_tokens = Some(budget + BUDGET_HEADROOM);
            }
        }
    }

    GenerationConfig {
        max_output_tokens: max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop_sequences: req.stop_sequences.clone(),
        thinking_config: thinking,
    }
}

/// Budget and level are mutually exclusive upstream; an explicit client
/// budget wins, then the client level, then configured defaults.
fn resolve_thinking(req: &MessagesRequest, opts: &TranslateOptions) -> Option<ThinkingConfig> {
    let client = req.thinking.as_ref();
    let budget = client.and_then(|t| t.budget_tokens);
    let level = client.and_then(|t| t.level);

    if let Some(budget) = budget {
        return Some(ThinkingConfig {
            include_thoughts: true,
            thinking_budget: Some(budget),
            thinking_level: None,
        });
    }
    if let Some(level) = level {
        return Some(ThinkingConfig {
            include_thoughts: true,
            thinking_budget: None,
            thinking_level: Some(format!("{level:?}").to_lowercase()),
        });
    }
    if let Some(budget) = opts.default_thinking_budget {
        return Some(ThinkingConfig {
            include_thoughts: true,
            thinking_budget: Some(budget),
            thinking_level: None,
        });
    }
    if let Some(level) = &opts.default_thinking_level {
        return Some(ThinkingConfig {
            include_thoughts: true,
            thinking_budget: None,
            thinking_level: Some(level.clone()),
        });
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
