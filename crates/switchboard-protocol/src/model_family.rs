// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-model-family capability lookups.
//!
//! The upstream serves three model families behind one API.  Their
//! handling differs in ways that matter to the translator: reasoning
//! signatures are family-specific and must never be mixed in one
//! request, the Gemini family enforces a hard output-token ceiling, and
//! the GPT family carries no signatures at all.

use serde::{Deserialize, Serialize};

/// Hard output-token ceiling for Gemini-family models.  Requests above
/// this are clamped; the upstream rejects larger values outright.
pub const GEMINI_MAX_OUTPUT_TOKENS: u32 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Claude,
    Gemini,
    Gpt,
}

/// Which signature dialect a reasoning signature belongs to.  Mixing
/// dialects in a single upstream request is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureFamily {
    Claude,
    Gemini,
}

impl ModelFamily {
    /// Classify a model id.  Unknown ids are treated as Gemini, which is
    /// the upstream's native family.
    pub fn of(model_id: &str) -> Self {
        let id = model_id.to_ascii_lowercase();
        if id.contains("claude") {
            Self::Claude
        } else if id.contains("gpt") {
            Self::Gpt
        } else {
            Self::Gemini
        }
    }

    /// Signature dialect produced by this family, if any.
    pub fn signature_family(self) -> Option<SignatureFamily> {
        match self {
            Self::Claude => Some(SignatureFamily::Claude),
            Self::Gemini => Some(SignatureFamily::Gemini),
            Self::Gpt => None,
        }
    }

    /// `true` when the family rejects reasoning blocks that lack a valid
    /// signature (they must be filtered before sending).
    pub fn requires_signed_reasoning(self) -> bool {
        self == Self::Claude
    }

    /// `true` when the family rejects empty text parts.
    pub fn rejects_empty_parts(self) -> bool {
        self == Self::Claude
    }

    /// Hard ceiling on `maxOutputTokens`, if the family enforces one.
    pub fn max_output_ceiling(self) -> Option<u32> {
        match self {
            Self::Gemini => Some(GEMINI_MAX_OUTPUT_TOKENS),
            _ => None,
        }
    }

    /// `true` when the self-identification scrub prompt should be
    /// prepended.  GPT-family targets ignore it and occasionally echo
    /// it, so it is skipped there.
    pub fn wants_identity_scrub(self) -> bool {
        self != Self::Gpt
    }
}

/// `true` when `model_id` can emit reasoning blocks.
pub fn supports_thinking(model_id: &str) -> bool {
    let id = model_id.to_ascii_lowercase();
    match ModelFamily::of(&id) {
        ModelFamily::Gemini => true,
        ModelFamily::Claude => id.contains("thinking"),
        ModelFamily::Gpt => id.contains("reasoning"),
    }
}

/// `true` when the model supports reasoning interleaved between tool
/// calls (the translator appends a system hint when enabled).
pub fn supports_interleaved_thinking(model_id: &str) -> bool {
    ModelFamily::of(model_id) == ModelFamily::Claude && supports_thinking(model_id)
}

/// Thinking-capable models are routed through the streaming endpoint
/// even for unary client requests; the unary endpoint has been observed
/// to hang on long reasoning turns.
pub fn prefers_streaming_upstream(model_id: &str) -> bool {
    supports_thinking(model_id)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
