// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/switchboard/config.json"));

    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("switchboard/config.json"));
    }

    paths.push(PathBuf::from("switchboard.json"));

    paths
}

/// Load configuration by merging all discovered JSON files, then apply
/// `SWITCHBOARD_*` environment overrides.  `extra` may provide an
/// explicit path (the `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_json::json!({});

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_json(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_json(&mut merged, read_layer(p)?);
    }

    apply_env_overrides(&mut merged);

    let config: Config = if merged.as_object().is_some_and(|m| m.is_empty()) {
        Config::default()
    } else {
        serde_json::from_value(merged).context("invalid configuration")?
    };
    Ok(config.normalised())
}

fn read_layer(path: &Path) -> anyhow::Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_json(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(d), serde_json::Value::Object(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(serde_json::json!({}));
                merge_json(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Environment variables override file values.  `SWITCHBOARD_MAX_RETRIES=5`
/// sets `max_retries`; values are parsed as JSON first so numbers and
/// booleans come through typed, falling back to plain strings.
fn apply_env_overrides(merged: &mut serde_json::Value) {
    const KEYS: &[&str] = &[
        "listen",
        "state_dir",
        "max_retries",
        "retry_base_ms",
        "retry_max_ms",
        "default_cooldown_ms",
        "max_cooldown_ms",
        "max_wait_before_error_ms",
        "max_context_tokens",
        "max_concurrent_requests",
        "infinite_retry_mode",
        "auto_fallback",
        "wait_progress_updates",
        "request_timeout_ms",
        "gemini_header_mode",
        "default_thinking_level",
        "default_thinking_budget",
    ];

    for key in KEYS {
        let var = format!("SWITCHBOARD_{}", key.to_uppercase());
        if let Ok(raw) = std::env::var(&var) {
            let value = serde_json::from_str(&raw)
                .unwrap_or(serde_json::Value::String(raw.clone()));
            debug!(%var, "applying environment override");
            let mut layer = serde_json::Map::new();
            layer.insert((*key).to_string(), value);
            merge_json(merged, serde_json::Value::Object(layer));
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = json!({ "x": 1 });
        merge_json(&mut dst, json!({ "x": 2 }));
        assert_eq!(dst["x"], 2);
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = json!({ "a": 1, "b": 2 });
        merge_json(&mut dst, json!({ "b": 99 }));
        assert_eq!(dst["a"], 1);
        assert_eq!(dst["b"], 99);
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = json!({ "account_selection": { "strategy": "sticky" } });
        merge_json(
            &mut dst,
            json!({ "account_selection": { "token_bucket": { "capacity": 10 } } }),
        );
        assert_eq!(dst["account_selection"]["strategy"], "sticky");
        assert_eq!(dst["account_selection"]["token_bucket"]["capacity"], 10);
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/switchboard_nonexistent_cfg.json")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{}", json!({ "max_retries": 9, "listen": "0.0.0.0:9000" })).unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.max_retries, 9);
        assert_eq!(cfg.listen, "0.0.0.0:9000");
        // Untouched fields keep their defaults.
        assert_eq!(cfg.max_concurrent_requests, 5);
    }

    #[test]
    fn load_clamps_out_of_range_retries() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{}", json!({ "max_retries": 100 })).unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.max_retries, 20);
    }
}
