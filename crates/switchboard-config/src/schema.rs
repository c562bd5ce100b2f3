// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the client-facing HTTP server.
    pub listen: String,
    /// Directory holding persisted state (`accounts.json`,
    /// `signature-cache.json`, `usage-history.json`).  Defaults to the
    /// platform data dir.
    pub state_dir: Option<PathBuf>,

    /// Outer dispatcher attempt cap.  Clamped to [1, 20] on load; the
    /// effective cap per request is `max(max_retries, accounts + 1)`.
    pub max_retries: u32,
    /// Exponential backoff band for transient upstream errors.
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Cooldown applied when an account is rate-limited and the upstream
    /// gave no usable reset hint.
    pub default_cooldown_ms: u64,
    /// Server-provided resets above this cap fall back to
    /// `default_cooldown_ms` (the hints are upper bounds, often wrong).
    pub max_cooldown_ms: u64,
    /// Longest a request will wait for a rate-limit reset before failing
    /// (ignored when `infinite_retry_mode` is set).
    pub max_wait_before_error_ms: u64,
    /// Context truncation budget in estimated tokens; 0 disables.
    pub max_context_tokens: usize,
    /// Per-account concurrent request cap.
    pub max_concurrent_requests: u32,
    /// Never fail a request because of rate limits; keep waiting.
    pub infinite_retry_mode: bool,
    /// Walk the model fallback chain when every account is exhausted.
    pub auto_fallback: bool,
    /// Emit progress events to streaming clients while waiting for a
    /// rate-limit reset.
    pub wait_progress_updates: bool,
    /// Per-upstream-call timeout.
    pub request_timeout_ms: u64,

    /// Which upstream header set (and therefore quota class) to use.
    pub gemini_header_mode: HeaderMode,
    /// Default reasoning level when the client does not ask for thinking.
    pub default_thinking_level: Option<ThinkingLevel>,
    /// Default reasoning budget in tokens.  Mutually exclusive with the
    /// level; when both are set the budget wins.
    pub default_thinking_budget: Option<u32>,

    pub account_selection: AccountSelectionConfig,

    /// Per-requested-model overrides.
    pub model_mapping: HashMap<String, ModelMapping>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8421".into(),
            state_dir: None,
            max_retries: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
            default_cooldown_ms: 60_000,
            max_cooldown_ms: 30 * 60_000,
            max_wait_before_error_ms: 10 * 60_000,
            max_context_tokens: 0,
            max_concurrent_requests: 5,
            infinite_retry_mode: false,
            auto_fallback: true,
            wait_progress_updates: true,
            request_timeout_ms: 5 * 60_000,
            gemini_header_mode: HeaderMode::Antigravity,
            default_thinking_level: None,
            default_thinking_budget: None,
            account_selection: AccountSelectionConfig::default(),
            model_mapping: HashMap::new(),
        }
    }
}

impl Config {
    /// Clamp out-of-range values instead of failing; a proxy that starts
    /// with a corrected config beats one that refuses to start.
    pub fn normalised(mut self) -> Self {
        self.max_retries = self.max_retries.clamp(1, 20);
        if self.retry_max_ms < self.retry_base_ms {
            self.retry_max_ms = self.retry_base_ms;
        }
        self
    }

    /// Resolved state directory (configured or platform default).
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("switchboard")
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMode {
    Cli,
    Antigravity,
}

impl HeaderMode {
    /// The quota-class label used in rate-limit keys for this mode.
    pub fn quota_class(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Antigravity => "antigravity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Minimal,
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

// ─── Account selection ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSelectionConfig {
    pub strategy: SelectionStrategy,
    pub health_score: HealthScoreConfig,
    pub token_bucket: TokenBucketConfig,
    pub quota: QuotaConfig,
    pub session_rotation: SessionRotationConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    Sticky,
    RoundRobin,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthScoreConfig {
    pub initial: f64,
    pub min: f64,
    pub max: f64,
    pub on_success: f64,
    pub on_rate_limit: f64,
    pub on_failure: f64,
    /// Passive recovery applied per hour since the last update.
    pub recovery_per_hour: f64,
}

impl Default for HealthScoreConfig {
    fn default() -> Self {
        Self {
            initial: 70.0,
            min: 50.0,
            max: 100.0,
            on_success: 1.0,
            on_rate_limit: -10.0,
            on_failure: -20.0,
            recovery_per_hour: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    pub capacity: f64,
    pub refill_per_minute: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self { capacity: 50.0, refill_per_minute: 6.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Accounts below this remaining fraction are deprioritised.
    pub low_threshold: f64,
    /// Accounts below this remaining fraction are excluded outright.
    pub critical_threshold: f64,
    /// Snapshots older than this no longer influence selection.
    pub stale_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            low_threshold: 0.1,
            critical_threshold: 0.05,
            stale_ms: 5 * 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRotationConfig {
    /// Rotate a session off its pinned account past this many messages.
    pub max_messages: u32,
    /// Rotate past this many estimated tokens consumed.
    pub max_tokens: u64,
    /// Rotate when the pinned account's remaining quota fraction trails
    /// the best alternative by at least this much.
    pub quota_gap: f64,
}

impl Default for SessionRotationConfig {
    fn default() -> Self {
        Self { max_messages: 40, max_tokens: 400_000, quota_gap: 0.2 }
    }
}

// ─── Model mapping ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelMapping {
    /// Omit the model from `/v1/models`.
    pub hidden: bool,
    /// Never rewrite requests for this model via the fallback chain.
    pub pinned: bool,
    /// Substitute upstream model id.
    pub mapping: Option<String>,
    /// Extra client-facing alias for the model.
    pub alias: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
