// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rate-limit bucket qualifier.  The same account and model hold
/// independent limits per class because the upstream enforces them
/// separately depending on the request header set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaClass {
    Cli,
    Antigravity,
    Unset,
}

impl QuotaClass {
    pub fn from_label(label: &str) -> Self {
        match label {
            "cli" => Self::Cli,
            "antigravity" => Self::Antigravity,
            _ => Self::Unset,
        }
    }
}

/// Composite rate-limit key `model[:class]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    pub model: String,
    pub class: QuotaClass,
}

impl QuotaKey {
    pub fn new(model: impl Into<String>, class: QuotaClass) -> Self {
        Self { model: model.into(), class }
    }

    /// Stable string form used as map key and in the persisted file.
    pub fn as_key(&self) -> String {
        match self.class {
            QuotaClass::Unset => self.model.clone(),
            QuotaClass::Cli => format!("{}:cli", self.model),
            QuotaClass::Antigravity => format!("{}:antigravity", self.model),
        }
    }

    /// `true` when `key` (in string form) refers to `model` under any class.
    pub fn key_matches_model(key: &str, model: &str) -> bool {
        key == model || key.strip_suffix(":cli") == Some(model)
            || key.strip_suffix(":antigravity") == Some(model)
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

/// Whether a limit is a daily quota (long cooldown floor) or anything
/// shorter-lived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    Daily,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub limited: bool,
    pub reset_at: DateTime<Utc>,
    #[serde(default)]
    pub limit_type: Option<LimitType>,
}

impl RateLimit {
    /// An entry only blocks while its reset time is in the future.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.limited && self.reset_at > now
    }
}

/// Per-model remaining-quota snapshot harvested from the upstream
/// metadata endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub remaining_fraction: f64,
    #[serde(default)]
    pub reset_time: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Ultra,
    #[default]
    Unknown,
}

/// Credential material for one upstream identity.  Either a long-lived
/// refresh token (exchanged for short-lived bearers) or a raw API key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// One upstream identity and its scheduling state.
///
/// Runtime-only fields (`active_requests`, consecutive failure counts)
/// are skipped during persistence: a restarted proxy has no requests in
/// flight and owes no penalties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Stable identity key (email-like).
    pub email: String,
    #[serde(default)]
    pub credential: Credential,
    /// Upstream project id, derived lazily on first use.
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    /// String-keyed by [`QuotaKey::as_key`].
    #[serde(default)]
    pub model_rate_limits: HashMap<String, RateLimit>,
    #[serde(default)]
    pub quota_snapshot: HashMap<String, QuotaSnapshot>,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
    #[serde(default)]
    pub disabled_models: HashSet<String>,

    #[serde(skip)]
    pub active_requests: u32,
    /// Consecutive rate-limit hits per quota key; drives the cooldown
    /// multiplier.  Cleared by the next success on that key.
    #[serde(skip)]
    pub limit_failures: HashMap<String, u32>,
}

fn default_enabled() -> bool {
    true
}

impl Account {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            credential: Credential::default(),
            project_id: None,
            enabled: true,
            invalid: false,
            invalid_reason: None,
            added_at: Utc::now(),
            last_used: None,
            model_rate_limits: HashMap::new(),
            quota_snapshot: HashMap::new(),
            subscription_tier: SubscriptionTier::Unknown,
            disabled_models: HashSet::new(),
            active_requests: 0,
            limit_failures: HashMap::new(),
        }
    }

    /// The active rate limit for `key`, if any.
    pub fn active_limit(&self, key: &QuotaKey, now: DateTime<Utc>) -> Option<&RateLimit> {
        self.model_rate_limits
            .get(&key.as_key())
            .filter(|l| l.is_active(now))
    }

    /// Remaining-quota fraction for `model`, if a fresh snapshot exists.
    /// Returns `None` once the snapshot's own reset time has passed (the
    /// quota has been replenished upstream and the data is stale).
    pub fn quota_fraction(&self, model: &str, now: DateTime<Utc>) -> Option<f64> {
        let snap = self.quota_snapshot.get(model)?;
        if snap.reset_time.is_some_and(|t| t <= now) {
            return None;
        }
        Some(snap.remaining_fraction)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
