// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Account selection policies.
//!
//! All three policies implement one trait so the dispatcher does not
//! care which is configured:
//!
//!   * `sticky` — keep a session on its pinned account while usable.
//!   * `round-robin` — rotate on every call, session-blind.
//!   * `hybrid` (default) — sticky pinning plus a weighted score over
//!     health, a per-account token bucket, quota snapshots, and idle
//!     time, with graceful degradation tiers when the strict candidate
//!     set is empty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use switchboard_config::{AccountSelectionConfig, SelectionStrategy, SessionRotationConfig};

use crate::account::{Account, QuotaKey};
use crate::pool::AccountPool;
use crate::session::SessionTracker;

/// Throttle applied when selection had to ignore health or token-bucket
/// state to find any candidate at all.
const DEGRADED_THROTTLE_LOW: Duration = Duration::from_millis(250);
const DEGRADED_THROTTLE_HIGH: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SelectionContext<'a> {
    pub key: &'a QuotaKey,
    pub session_id: Option<&'a str>,
    /// Longest the caller is prepared to wait for a pinned account's
    /// rate limit to reset instead of failing over.
    pub max_wait: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub account: Option<String>,
    /// When `account` is `None`, a non-zero wait means "sleep this long
    /// and retry"; zero means the caller should fail over immediately.
    pub wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    Failure,
}

pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(
        &self,
        pool: &Arc<AccountPool>,
        sessions: &SessionTracker,
        ctx: &SelectionContext<'_>,
    ) -> Selection;

    /// Feed request outcomes back into policy state.  Stateless
    /// policies ignore this.
    fn record_outcome(&self, _email: &str, _outcome: Outcome) {}
}

/// Build the configured policy.
pub fn build_policy(cfg: &AccountSelectionConfig) -> Arc<dyn SelectionPolicy> {
    match cfg.strategy {
        SelectionStrategy::Sticky => Arc::new(StickyPolicy { rotation: cfg.session_rotation.clone() }),
        SelectionStrategy::RoundRobin => Arc::new(RoundRobinPolicy),
        SelectionStrategy::Hybrid => Arc::new(HybridPolicy::new(cfg.clone())),
    }
}

// ─── Shared helpers ───────────────────────────────────────────────────────────

/// Rotation triggers shared by the sticky and hybrid policies: a session
/// leaves its pinned account when the conversation has grown too long,
/// consumed too many tokens, or the pinned account's remaining quota
/// trails another account by at least the configured gap.
fn should_rotate(
    pool: &AccountPool,
    sessions: &SessionTracker,
    session_id: &str,
    pinned: &str,
    model: &str,
    rotation: &SessionRotationConfig,
) -> bool {
    let Some(session) = sessions.get(session_id) else { return false };
    if session.message_count > rotation.max_messages {
        debug!(session = session_id, "rotating session: message count");
        return true;
    }
    if session.tokens_consumed > rotation.max_tokens {
        debug!(session = session_id, "rotating session: token consumption");
        return true;
    }

    let now = Utc::now();
    let pinned_fraction = pool
        .with_account(pinned, |a| a.quota_fraction(model, now))
        .flatten();
    if let Some(fraction) = pinned_fraction {
        if fraction < pool.tuning().min_quota_fraction + rotation.quota_gap {
            let better_exists = pool.accounts().iter().any(|a| {
                a.email != pinned
                    && a.quota_fraction(model, now)
                        .is_some_and(|f| f >= fraction + rotation.quota_gap)
            });
            if better_exists {
                debug!(session = session_id, "rotating session: quota gap");
                return true;
            }
        }
    }
    false
}

/// Wait hint when nothing is usable: if the pinned (or any) account's
/// limit resets within `max_wait`, tell the dispatcher to sleep.
fn wait_hint(pool: &AccountPool, key: &QuotaKey, max_wait: Duration) -> Duration {
    match pool.min_wait(key) {
        Some(wait) if wait <= max_wait => wait,
        _ => Duration::ZERO,
    }
}

// ─── Sticky ───────────────────────────────────────────────────────────────────

pub struct StickyPolicy {
    rotation: SessionRotationConfig,
}

impl SelectionPolicy for StickyPolicy {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn select(
        &self,
        pool: &Arc<AccountPool>,
        sessions: &SessionTracker,
        ctx: &SelectionContext<'_>,
    ) -> Selection {
        let now = Utc::now();

        if let Some(session_id) = ctx.session_id {
            if let Some(pinned) = sessions.get(session_id).and_then(|s| s.pinned_account) {
                let rotate = should_rotate(
                    pool, sessions, session_id, &pinned, &ctx.key.model, &self.rotation,
                );
                let usable = pool
                    .with_account(&pinned, |a| pool.usable(a, ctx.key, now))
                    .unwrap_or(false);
                if usable && !rotate {
                    return Selection { account: Some(pinned), wait: Duration::ZERO };
                }
                if rotate {
                    sessions.unpin(session_id);
                }
            }
        }

        if let Some(email) = pool.next_round_robin(ctx.key) {
            if let Some(session_id) = ctx.session_id {
                sessions.pin(session_id, &email);
            }
            return Selection { account: Some(email), wait: Duration::ZERO };
        }

        Selection { account: None, wait: wait_hint(pool, ctx.key, ctx.max_wait) }
    }
}

// ─── Round-robin ──────────────────────────────────────────────────────────────

pub struct RoundRobinPolicy;

impl SelectionPolicy for RoundRobinPolicy {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(
        &self,
        pool: &Arc<AccountPool>,
        _sessions: &SessionTracker,
        ctx: &SelectionContext<'_>,
    ) -> Selection {
        match pool.next_round_robin(ctx.key) {
            Some(email) => Selection { account: Some(email), wait: Duration::ZERO },
            None => Selection { account: None, wait: wait_hint(pool, ctx.key, ctx.max_wait) },
        }
    }
}

// ─── Hybrid ───────────────────────────────────────────────────────────────────

struct HealthEntry {
    score: f64,
    updated: DateTime<Utc>,
}

struct BucketEntry {
    tokens: f64,
    updated: DateTime<Utc>,
}

pub struct HybridPolicy {
    cfg: AccountSelectionConfig,
    health: Mutex<HashMap<String, HealthEntry>>,
    buckets: Mutex<HashMap<String, BucketEntry>>,
}

impl HybridPolicy {
    pub fn new(cfg: AccountSelectionConfig) -> Self {
        Self {
            cfg,
            health: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Current health score with passive recovery applied.
    fn health_of(&self, email: &str) -> f64 {
        let hs = &self.cfg.health_score;
        let now = Utc::now();
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let entry = health.entry(email.to_string()).or_insert(HealthEntry {
            score: hs.initial,
            updated: now,
        });
        let hours = (now - entry.updated).num_seconds().max(0) as f64 / 3600.0;
        if hours > 0.0 {
            entry.score = (entry.score + hours * hs.recovery_per_hour).clamp(hs.min, hs.max);
            entry.updated = now;
        }
        entry.score
    }

    fn adjust_health(&self, email: &str, delta: f64) {
        let hs = &self.cfg.health_score;
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let entry = health.entry(email.to_string()).or_insert(HealthEntry {
            score: hs.initial,
            updated: Utc::now(),
        });
        entry.score = (entry.score + delta).clamp(hs.min, hs.max);
        entry.updated = Utc::now();
    }

    /// Refill and read the token bucket without consuming.
    fn bucket_tokens(&self, email: &str) -> f64 {
        let tb = &self.cfg.token_bucket;
        let now = Utc::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let entry = buckets.entry(email.to_string()).or_insert(BucketEntry {
            tokens: tb.capacity,
            updated: now,
        });
        let minutes = (now - entry.updated).num_milliseconds().max(0) as f64 / 60_000.0;
        entry.tokens = (entry.tokens + minutes * tb.refill_per_minute).min(tb.capacity);
        entry.updated = now;
        entry.tokens
    }

    fn consume_token(&self, email: &str) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = buckets.get_mut(email) {
            entry.tokens = (entry.tokens - 1.0).max(0.0);
        }
    }

    fn score(&self, account: &Account, model: &str, now: DateTime<Utc>) -> f64 {
        let hs = &self.cfg.health_score;
        let tb = &self.cfg.token_bucket;

        let health = self.health_of(&account.email);
        let tokens = self.bucket_tokens(&account.email);
        // Unknown quota scores neutral; a fresh snapshot maps its
        // remaining fraction onto 0–100.
        let quota_score = account
            .quota_fraction(model, now)
            .map_or(50.0, |f| f * 100.0);
        let idle_secs = account
            .last_used
            .map_or(3600.0, |t| (now - t).num_seconds().max(0) as f64);

        2.0 * health.min(hs.max) + 5.0 * (tokens / tb.capacity) * 100.0 + 3.0 * quota_score
            + 0.1 * idle_secs
    }
}

/// Candidate filter tiers, strictest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Strict,
    IgnoreQuota,
    IgnoreHealth,
    IgnoreTokens,
}

impl SelectionPolicy for HybridPolicy {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn select(
        &self,
        pool: &Arc<AccountPool>,
        sessions: &SessionTracker,
        ctx: &SelectionContext<'_>,
    ) -> Selection {
        let now = Utc::now();

        // Sticky pinning first: a healthy pinned account keeps the
        // upstream cache warm, which outweighs a marginally better score.
        if let Some(session_id) = ctx.session_id {
            if let Some(pinned) = sessions.get(session_id).and_then(|s| s.pinned_account) {
                let rotate = should_rotate(
                    pool,
                    sessions,
                    session_id,
                    &pinned,
                    &ctx.key.model,
                    &self.cfg.session_rotation,
                );
                let usable = pool
                    .with_account(&pinned, |a| pool.usable(a, ctx.key, now))
                    .unwrap_or(false);
                if usable && !rotate {
                    self.consume_token(&pinned);
                    return Selection { account: Some(pinned), wait: Duration::ZERO };
                }
                if rotate {
                    sessions.unpin(session_id);
                }
            }
        }

        let accounts = pool.accounts();
        let quota = &self.cfg.quota;

        for tier in [Tier::Strict, Tier::IgnoreQuota, Tier::IgnoreHealth, Tier::IgnoreTokens] {
            let mut best: Option<(f64, &Account)> = None;
            for account in &accounts {
                // Core usability (validity, concurrency, rate limits,
                // disabled models) is never waived.
                let core = !account.invalid
                    && account.enabled
                    && account.active_requests < pool.tuning().max_concurrent_requests
                    && account.active_limit(ctx.key, now).is_none()
                    && !account.disabled_models.contains(&ctx.key.model);
                if !core {
                    continue;
                }

                if tier == Tier::Strict {
                    // Low and critically-low quota are strict-tier
                    // exclusions; the ignore-quota tier waives both.
                    if account
                        .quota_fraction(&ctx.key.model, now)
                        .is_some_and(|f| f < quota.low_threshold.max(quota.critical_threshold))
                    {
                        continue;
                    }
                }
                if matches!(tier, Tier::Strict | Tier::IgnoreQuota)
                    && self.health_of(&account.email) <= self.cfg.health_score.min
                {
                    continue;
                }
                if !matches!(tier, Tier::IgnoreTokens) && self.bucket_tokens(&account.email) < 1.0
                {
                    continue;
                }

                let score = self.score(account, &ctx.key.model, now);
                if best.as_ref().is_none_or(|(s, _)| score > *s) {
                    best = Some((score, account));
                }
            }

            if let Some((score, account)) = best {
                debug!(
                    email = %account.email,
                    score = format!("{score:.1}"),
                    ?tier,
                    "hybrid selection"
                );
                self.consume_token(&account.email);
                if let Some(session_id) = ctx.session_id {
                    sessions.pin(session_id, &account.email);
                }
                let wait = match tier {
                    Tier::Strict | Tier::IgnoreQuota => Duration::ZERO,
                    Tier::IgnoreHealth => DEGRADED_THROTTLE_LOW,
                    Tier::IgnoreTokens => DEGRADED_THROTTLE_HIGH,
                };
                return Selection { account: Some(account.email.clone()), wait };
            }
        }

        Selection { account: None, wait: wait_hint(pool, ctx.key, ctx.max_wait) }
    }

    fn record_outcome(&self, email: &str, outcome: Outcome) {
        let hs = &self.cfg.health_score;
        let delta = match outcome {
            Outcome::Success => hs.on_success,
            Outcome::RateLimited => hs.on_rate_limit,
            Outcome::Failure => hs.on_failure,
        };
        self.adjust_health(email, delta);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, LimitType, QuotaClass, QuotaSnapshot};
    use crate::pool::{AccountPool, PoolTuning};

    fn setup(emails: &[&str]) -> (Arc<AccountPool>, SessionTracker) {
        let pool = Arc::new(AccountPool::new(PoolTuning::default()));
        for e in emails {
            pool.add(Account::new(*e));
        }
        (pool, SessionTracker::new())
    }

    fn ctx<'a>(key: &'a QuotaKey, session: Option<&'a str>) -> SelectionContext<'a> {
        SelectionContext { key, session_id: session, max_wait: Duration::from_secs(600) }
    }

    #[test]
    fn sticky_reuses_pinned_account() {
        let (pool, sessions) = setup(&["a@x", "b@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        sessions.touch("s1", 1);
        let p = StickyPolicy { rotation: SessionRotationConfig::default() };

        let first = p.select(&pool, &sessions, &ctx(&key, Some("s1"))).account.unwrap();
        for _ in 0..5 {
            let again = p.select(&pool, &sessions, &ctx(&key, Some("s1"))).account.unwrap();
            assert_eq!(again, first, "sticky must not rotate while usable");
        }
    }

    #[test]
    fn sticky_fails_over_when_pinned_limited() {
        let (pool, sessions) = setup(&["a@x", "b@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        sessions.touch("s1", 1);
        let p = StickyPolicy { rotation: SessionRotationConfig::default() };

        let first = p.select(&pool, &sessions, &ctx(&key, Some("s1"))).account.unwrap();
        pool.mark_rate_limited(&first, &key, Some(Duration::from_secs(600)), LimitType::Other);
        let second = p.select(&pool, &sessions, &ctx(&key, Some("s1"))).account.unwrap();
        assert_ne!(second, first);
        // The new account becomes the pin.
        assert_eq!(sessions.get("s1").unwrap().pinned_account.as_deref(), Some(second.as_str()));
    }

    #[test]
    fn sticky_returns_wait_when_everything_limited_but_reset_close() {
        let (pool, sessions) = setup(&["a@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        pool.mark_rate_limited("a@x", &key, Some(Duration::from_secs(30)), LimitType::Other);
        let p = StickyPolicy { rotation: SessionRotationConfig::default() };
        let sel = p.select(&pool, &sessions, &ctx(&key, None));
        assert!(sel.account.is_none());
        assert!(sel.wait > Duration::ZERO);
        assert!(sel.wait <= Duration::from_secs(30));
    }

    #[test]
    fn sticky_returns_zero_wait_when_reset_too_far() {
        let (pool, sessions) = setup(&["a@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        // 20-minute cooldown exceeds the 10-minute ceiling.
        pool.mark_rate_limited("a@x", &key, Some(Duration::from_secs(1200)), LimitType::Other);
        let p = StickyPolicy { rotation: SessionRotationConfig::default() };
        let sel = p.select(&pool, &sessions, &ctx(&key, None));
        assert!(sel.account.is_none());
        assert_eq!(sel.wait, Duration::ZERO);
    }

    #[test]
    fn round_robin_rotates_every_call() {
        let (pool, sessions) = setup(&["a@x", "b@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        let p = RoundRobinPolicy;
        let first = p.select(&pool, &sessions, &ctx(&key, None)).account.unwrap();
        let second = p.select(&pool, &sessions, &ctx(&key, None)).account.unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn rotation_trigger_message_count() {
        let (pool, sessions) = setup(&["a@x", "b@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        let rotation = SessionRotationConfig { max_messages: 2, ..Default::default() };
        let p = StickyPolicy { rotation };

        sessions.touch("s1", 1);
        let first = p.select(&pool, &sessions, &ctx(&key, Some("s1"))).account.unwrap();
        sessions.touch("s1", 10);
        let second = p.select(&pool, &sessions, &ctx(&key, Some("s1"))).account.unwrap();
        assert_ne!(second, first, "long session must rotate off its pin");
    }

    #[test]
    fn hybrid_prefers_idle_high_quota_account() {
        let (pool, sessions) = setup(&["busy@x", "idle@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        let now = Utc::now();
        pool.update_quota_snapshot(
            "busy@x",
            "x",
            QuotaSnapshot {
                remaining_fraction: 0.2,
                reset_time: Some(now + chrono::Duration::hours(4)),
                fetched_at: now,
            },
        );
        pool.update_quota_snapshot(
            "idle@x",
            "x",
            QuotaSnapshot {
                remaining_fraction: 0.9,
                reset_time: Some(now + chrono::Duration::hours(4)),
                fetched_at: now,
            },
        );
        let p = HybridPolicy::new(AccountSelectionConfig::default());
        let sel = p.select(&pool, &sessions, &ctx(&key, None));
        assert_eq!(sel.account.as_deref(), Some("idle@x"));
        assert_eq!(sel.wait, Duration::ZERO);
    }

    #[test]
    fn hybrid_health_penalty_steers_away() {
        let (pool, sessions) = setup(&["a@x", "b@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        let p = HybridPolicy::new(AccountSelectionConfig::default());
        // Two failures drop a@x well below b@x.
        p.record_outcome("a@x", Outcome::Failure);
        p.record_outcome("a@x", Outcome::Failure);
        let sel = p.select(&pool, &sessions, &ctx(&key, None));
        assert_eq!(sel.account.as_deref(), Some("b@x"));
    }

    #[test]
    fn hybrid_sticky_pin_survives_scoring() {
        let (pool, sessions) = setup(&["a@x", "b@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        sessions.touch("s1", 1);
        let p = HybridPolicy::new(AccountSelectionConfig::default());
        let first = p.select(&pool, &sessions, &ctx(&key, Some("s1"))).account.unwrap();
        for _ in 0..3 {
            let again = p.select(&pool, &sessions, &ctx(&key, Some("s1"))).account.unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn hybrid_ignores_quota_when_strict_set_empty() {
        let (pool, sessions) = setup(&["low@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        let now = Utc::now();
        // Below low_threshold (0.1) but above critical (0.05): the pool
        // predicate excludes it, the hybrid fallback tier recovers it.
        pool.update_quota_snapshot(
            "low@x",
            "x",
            QuotaSnapshot {
                remaining_fraction: 0.07,
                reset_time: Some(now + chrono::Duration::hours(4)),
                fetched_at: now,
            },
        );
        let p = HybridPolicy::new(AccountSelectionConfig::default());
        let sel = p.select(&pool, &sessions, &ctx(&key, None));
        assert_eq!(sel.account.as_deref(), Some("low@x"));
    }

    #[test]
    fn hybrid_critical_quota_recovered_by_ignore_quota_tier() {
        let (pool, sessions) = setup(&["crit@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        let now = Utc::now();
        pool.update_quota_snapshot(
            "crit@x",
            "x",
            QuotaSnapshot {
                remaining_fraction: 0.01,
                reset_time: Some(now + chrono::Duration::hours(4)),
                fetched_at: now,
            },
        );
        let p = HybridPolicy::new(AccountSelectionConfig::default());
        let sel = p.select(&pool, &sessions, &ctx(&key, None));
        // The ignore-quota tier waives the critical exclusion, and that
        // tier carries no throttle.
        assert_eq!(sel.account.as_deref(), Some("crit@x"));
        assert_eq!(sel.wait, Duration::ZERO);
    }

    #[test]
    fn hybrid_token_bucket_exhaustion_throttles() {
        let (pool, sessions) = setup(&["a@x"]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        let cfg = AccountSelectionConfig {
            token_bucket: switchboard_config::TokenBucketConfig {
                capacity: 2.0,
                refill_per_minute: 0.0,
            },
            ..Default::default()
        };
        let p = HybridPolicy::new(cfg);
        // Drain the two tokens.
        assert_eq!(
            p.select(&pool, &sessions, &ctx(&key, None)).wait,
            Duration::ZERO
        );
        assert_eq!(
            p.select(&pool, &sessions, &ctx(&key, None)).wait,
            Duration::ZERO
        );
        // Bucket empty: the account is only reachable by the last tier.
        let sel = p.select(&pool, &sessions, &ctx(&key, None));
        assert_eq!(sel.account.as_deref(), Some("a@x"));
        assert_eq!(sel.wait, DEGRADED_THROTTLE_HIGH);
    }

    #[test]
    fn no_accounts_yields_empty_selection() {
        let (pool, sessions) = setup(&[]);
        let key = QuotaKey::new("x", QuotaClass::Unset);
        for policy in [
            build_policy(&AccountSelectionConfig::default()),
            build_policy(&AccountSelectionConfig {
                strategy: SelectionStrategy::Sticky,
                ..Default::default()
            }),
            build_policy(&AccountSelectionConfig {
                strategy: SelectionStrategy::RoundRobin,
                ..Default::default()
            }),
        ] {
            let sel = policy.select(&pool, &sessions, &ctx(&key, None));
            assert!(sel.account.is_none());
            assert_eq!(sel.wait, Duration::ZERO);
        }
    }
}
