// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static model fallback chain and model-id resolution.
//!
//! When every account is exhausted for a model, the dispatcher may walk
//! one step down a static next-best chain.  The chain is validated for
//! cycles at startup; a cycle is a configuration bug, not something to
//! discover at request time.

use std::collections::HashMap;

use switchboard_config::Config;

/// Built-in next-best pairs.  Claude-routed models degrade onto the
/// native family; within the native family, pro degrades to flash.
const DEFAULT_CHAIN: &[(&str, &str)] = &[
    ("claude-sonnet-4-5-thinking", "gemini-3-pro-preview"),
    ("claude-sonnet-4-5", "gemini-3-pro-preview"),
    ("gemini-3-pro-preview", "gemini-2.5-pro"),
    ("gemini-2.5-pro", "gemini-2.5-flash"),
];

#[derive(Debug, Clone)]
pub struct FallbackChain {
    next: HashMap<String, String>,
}

impl FallbackChain {
    pub fn new() -> anyhow::Result<Self> {
        Self::from_pairs(
            DEFAULT_CHAIN
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string())),
        )
    }

    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (String, String)>,
    ) -> anyhow::Result<Self> {
        let next: HashMap<String, String> = pairs.into_iter().collect();

        // Reject cycles: walking from any key must terminate.
        for start in next.keys() {
            let mut seen = vec![start.as_str()];
            let mut cursor = start.as_str();
            while let Some(n) = next.get(cursor) {
                if seen.contains(&n.as_str()) {
                    anyhow::bail!("fallback chain contains a cycle through {n}");
                }
                seen.push(n);
                cursor = n;
            }
        }
        Ok(Self { next })
    }

    /// The next-best model after `model`, if any.
    pub fn next(&self, model: &str) -> Option<&str> {
        self.next.get(model).map(String::as_str)
    }
}

/// Resolve a client-requested model id to the upstream model id, taking
/// `model_mapping` aliases and substitutions into account.  Unknown
/// models pass through unchanged.
pub fn resolve_model(config: &Config, requested: &str) -> String {
    if let Some(entry) = config.model_mapping.get(requested) {
        if let Some(mapped) = &entry.mapping {
            return mapped.clone();
        }
        return requested.to_string();
    }
    // An alias maps an extra client-facing name onto a configured model.
    for (model, entry) in &config.model_mapping {
        if entry.alias.as_deref() == Some(requested) {
            return entry.mapping.clone().unwrap_or_else(|| model.clone());
        }
    }
    requested.to_string()
}

/// `true` when fallback must never rewrite this model.
pub fn is_pinned(config: &Config, requested: &str) -> bool {
    config
        .model_mapping
        .get(requested)
        .is_some_and(|entry| entry.pinned)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_config::ModelMapping;

    #[test]
    fn default_chain_is_acyclic() {
        let chain = FallbackChain::new().unwrap();
        assert_eq!(chain.next("gemini-3-pro-preview"), Some("gemini-2.5-pro"));
        assert_eq!(chain.next("gemini-2.5-flash"), None);
    }

    #[test]
    fn cycle_is_rejected() {
        let result = FallbackChain::from_pairs([
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "a".to_string()),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn self_loop_is_rejected() {
        let result = FallbackChain::from_pairs([("a".to_string(), "a".to_string())]);
        assert!(result.is_err());
    }

    #[test]
    fn resolve_model_applies_mapping() {
        let mut config = Config::default();
        config.model_mapping.insert(
            "claude-opus-4".into(),
            ModelMapping { mapping: Some("gemini-3-pro-preview".into()), ..Default::default() },
        );
        assert_eq!(resolve_model(&config, "claude-opus-4"), "gemini-3-pro-preview");
        assert_eq!(resolve_model(&config, "unmapped"), "unmapped");
    }

    #[test]
    fn resolve_model_follows_alias() {
        let mut config = Config::default();
        config.model_mapping.insert(
            "gemini-3-pro-preview".into(),
            ModelMapping { alias: Some("smart".into()), ..Default::default() },
        );
        assert_eq!(resolve_model(&config, "smart"), "gemini-3-pro-preview");
    }

    #[test]
    fn pinned_models_are_flagged() {
        let mut config = Config::default();
        config.model_mapping.insert(
            "gemini-3-pro-preview".into(),
            ModelMapping { pinned: true, ..Default::default() },
        );
        assert!(is_pinned(&config, "gemini-3-pro-preview"));
        assert!(!is_pinned(&config, "other"));
    }
}
