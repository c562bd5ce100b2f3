// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The account pool: upstream identities, their per-(model, class)
//! rate-limit state, and concurrency accounting.
//!
//! All operations take short critical sections under one pool lock; no
//! lock is ever held across an await point.  Concurrency slots are
//! handed out as RAII permits so a slot is returned on every exit path,
//! including client disconnects and panics.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::account::{Account, LimitType, QuotaKey, QuotaSnapshot, RateLimit, SubscriptionTier};
use crate::persist::{read_json, Saver};

/// Cooldown floor for daily-quota limits.
const DAILY_COOLDOWN_FLOOR: Duration = Duration::from_secs(3600);
/// Cap on the consecutive-failure cooldown multiplier.
const MAX_COOLDOWN_MULTIPLIER: u32 = 30;

#[derive(Debug, Clone)]
pub struct PoolTuning {
    pub max_concurrent_requests: u32,
    pub default_cooldown: Duration,
    /// Server-provided reset hints above this are distrusted.
    pub max_cooldown: Duration,
    /// Minimum remaining-quota fraction for an account to stay usable.
    pub min_quota_fraction: f64,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            default_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(30 * 60),
            min_quota_fraction: 0.1,
        }
    }
}

struct Inner {
    accounts: Vec<Account>,
    /// Round-robin cursor shared by the selection policies.
    cursor: usize,
}

pub struct AccountPool {
    inner: RwLock<Inner>,
    tuning: PoolTuning,
    saver: Option<Arc<Saver>>,
}

/// RAII concurrency slot.  Dropping the permit releases the slot.
pub struct Permit {
    pool: Arc<AccountPool>,
    email: String,
}

impl Permit {
    pub fn email(&self) -> &str {
        &self.email
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.pool.release(&self.email);
    }
}

impl AccountPool {
    pub fn new(tuning: PoolTuning) -> Self {
        Self {
            inner: RwLock::new(Inner { accounts: Vec::new(), cursor: 0 }),
            tuning,
            saver: None,
        }
    }

    /// Open (or create) a pool backed by `path`.
    pub fn with_persistence(path: PathBuf, tuning: PoolTuning) -> anyhow::Result<Self> {
        let mut accounts = Vec::new();
        if let Some(v) = read_json(&path)? {
            accounts = serde_json::from_value(v["accounts"].clone()).unwrap_or_default();
            info!(count = accounts.len(), path = %path.display(), "loaded account pool");
        }
        Ok(Self {
            inner: RwLock::new(Inner { accounts, cursor: 0 }),
            tuning,
            saver: Some(Arc::new(Saver::new(path))),
        })
    }

    pub fn tuning(&self) -> &PoolTuning {
        &self.tuning
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule_save(&self) {
        if let Some(saver) = &self.saver {
            saver.schedule(self.snapshot_json());
        }
    }

    fn snapshot_json(&self) -> serde_json::Value {
        let inner = self.read();
        serde_json::json!({ "accounts": inner.accounts })
    }

    /// Synchronous flush for shutdown.
    pub fn flush(&self) {
        if let Some(saver) = &self.saver {
            saver.flush_now(self.snapshot_json());
        }
    }

    // ── Membership ────────────────────────────────────────────────────────────

    /// Upsert by email.  Existing accounts keep their `added_at` and
    /// have `invalid` reset, so re-enrolling is the recovery path for a
    /// revoked credential.
    pub fn add(&self, mut account: Account) {
        {
            let mut inner = self.write();
            if let Some(existing) = inner.accounts.iter_mut().find(|a| a.email == account.email)
            {
                account.added_at = existing.added_at;
                account.invalid = false;
                account.invalid_reason = None;
                account.active_requests = existing.active_requests;
                *existing = account;
            } else {
                inner.accounts.push(account);
            }
        }
        self.schedule_save();
    }

    pub fn remove(&self, email: &str) -> bool {
        let removed = {
            let mut inner = self.write();
            match inner.accounts.iter().position(|a| a.email == email) {
                Some(idx) => {
                    inner.accounts.remove(idx);
                    // Keep the round-robin cursor pointing at the same
                    // neighbourhood after the shift.
                    if idx < inner.cursor {
                        inner.cursor -= 1;
                    }
                    if !inner.accounts.is_empty() {
                        inner.cursor %= inner.accounts.len();
                    } else {
                        inner.cursor = 0;
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
            self.schedule_save();
        }
        removed
    }

    pub fn set_enabled(&self, email: &str, enabled: bool) -> bool {
        let changed = {
            let mut inner = self.write();
            match inner.accounts.iter_mut().find(|a| a.email == email) {
                Some(a) => {
                    a.enabled = enabled;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.schedule_save();
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.read().accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().accounts.is_empty()
    }

    /// Cloned snapshot for read-only consumers (status surfaces, tests).
    pub fn accounts(&self) -> Vec<Account> {
        self.read().accounts.clone()
    }

    /// Run `f` against one account without cloning.
    pub fn with_account<R>(&self, email: &str, f: impl FnOnce(&Account) -> R) -> Option<R> {
        let inner = self.read();
        inner.accounts.iter().find(|a| a.email == email).map(f)
    }

    // ── Concurrency ───────────────────────────────────────────────────────────

    /// Take a concurrency slot on `email`.  Returns `None` for unknown
    /// accounts.  The caller is expected to have checked usability; the
    /// borrow itself never blocks.
    pub fn borrow(self: &Arc<Self>, email: &str) -> Option<Permit> {
        let mut inner = self.write();
        let account = inner.accounts.iter_mut().find(|a| a.email == email)?;
        account.active_requests += 1;
        debug!(email, active = account.active_requests, "borrowed concurrency slot");
        Some(Permit { pool: Arc::clone(self), email: email.to_string() })
    }

    fn release(&self, email: &str) {
        let mut inner = self.write();
        if let Some(account) = inner.accounts.iter_mut().find(|a| a.email == email) {
            if account.active_requests == 0 {
                warn!(email, "release with no outstanding borrow");
            } else {
                account.active_requests -= 1;
            }
        }
    }

    // ── Rate limits & validity ────────────────────────────────────────────────

    /// Record a successful request: update `last_used` and clear the
    /// consecutive-failure count for this quota key.
    pub fn record_success(&self, email: &str, key: &QuotaKey) {
        {
            let mut inner = self.write();
            if let Some(a) = inner.accounts.iter_mut().find(|a| a.email == email) {
                a.last_used = Some(Utc::now());
                a.limit_failures.remove(&key.as_key());
            }
        }
        self.schedule_save();
    }

    /// Mark `email` rate-limited for `key`.
    ///
    /// Cooldown selection: daily limits get a one-hour floor; other
    /// limits take the server hint when it is plausible (under
    /// `max_cooldown`), else the configured default.  Consecutive hits
    /// on the same key double the cooldown each time, capped at 30×.
    pub fn mark_rate_limited(
        &self,
        email: &str,
        key: &QuotaKey,
        reset_hint: Option<Duration>,
        limit_type: LimitType,
    ) {
        let now = Utc::now();
        {
            let mut inner = self.write();
            let Some(a) = inner.accounts.iter_mut().find(|a| a.email == email) else {
                return;
            };
            let failures = a.limit_failures.entry(key.as_key()).or_insert(0);
            *failures += 1;

            let base = match limit_type {
                LimitType::Daily => {
                    reset_hint.unwrap_or(DAILY_COOLDOWN_FLOOR).max(DAILY_COOLDOWN_FLOOR)
                }
                LimitType::Other => match reset_hint {
                    Some(hint) if hint <= self.tuning.max_cooldown => hint,
                    _ => self.tuning.default_cooldown,
                },
            };
            let multiplier = 1u32
                .checked_shl(failures.saturating_sub(1))
                .unwrap_or(MAX_COOLDOWN_MULTIPLIER)
                .min(MAX_COOLDOWN_MULTIPLIER);
            let cooldown = base.saturating_mul(multiplier);

            warn!(
                email,
                key = %key,
                ?limit_type,
                consecutive = *failures,
                cooldown_secs = cooldown.as_secs(),
                "account rate-limited"
            );
            a.model_rate_limits.insert(
                key.as_key(),
                RateLimit {
                    limited: true,
                    reset_at: now
                        + chrono::Duration::from_std(cooldown)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                    limit_type: Some(limit_type),
                },
            );
        }
        self.schedule_save();
    }

    /// Permanently invalidate an account.  There is no self-recovery;
    /// re-enrolling via [`AccountPool::add`] clears the flag.
    pub fn mark_invalid(&self, email: &str, reason: &str) {
        {
            let mut inner = self.write();
            if let Some(a) = inner.accounts.iter_mut().find(|a| a.email == email) {
                warn!(email, reason, "account marked invalid");
                a.invalid = true;
                a.invalid_reason = Some(reason.to_string());
            }
        }
        self.schedule_save();
    }

    /// Sweep expired rate-limit entries.
    pub fn clear_expired(&self) {
        let now = Utc::now();
        let mut changed = false;
        {
            let mut inner = self.write();
            for a in inner.accounts.iter_mut() {
                let before = a.model_rate_limits.len();
                a.model_rate_limits.retain(|_, l| l.is_active(now));
                changed |= a.model_rate_limits.len() != before;
            }
        }
        if changed {
            self.schedule_save();
        }
    }

    /// Optimistic unblock: clear every rate limit recorded for `model`
    /// (all classes, all accounts).  The upstream's reset hints are
    /// upper bounds and often wrong, so when the whole pool is limited
    /// we probe once rather than trust them.
    pub fn reset_all_for(&self, model: &str) {
        warn!(model, "optimistic reset: clearing rate limits for all accounts");
        {
            let mut inner = self.write();
            for a in inner.accounts.iter_mut() {
                a.model_rate_limits
                    .retain(|k, _| !QuotaKey::key_matches_model(k, model));
            }
        }
        self.schedule_save();
    }

    // ── Usability ─────────────────────────────────────────────────────────────

    /// The single usability predicate.  An account can serve
    /// `(model, class)` iff it is valid, enabled, under its concurrency
    /// cap, not rate-limited on the key, has not disabled the model, and
    /// its quota snapshot (if any, and still current) is above the
    /// minimum fraction.
    pub fn usable(&self, account: &Account, key: &QuotaKey, now: DateTime<Utc>) -> bool {
        !account.invalid
            && account.enabled
            && account.active_requests < self.tuning.max_concurrent_requests
            && account.active_limit(key, now).is_none()
            && !account.disabled_models.contains(&key.model)
            && account
                .quota_fraction(&key.model, now)
                .is_none_or(|f| f >= self.tuning.min_quota_fraction)
    }

    /// Emails of all currently usable accounts, in pool order.
    pub fn usable_emails(&self, key: &QuotaKey) -> Vec<String> {
        let now = Utc::now();
        let inner = self.read();
        inner
            .accounts
            .iter()
            .filter(|a| self.usable(a, key, now))
            .map(|a| a.email.clone())
            .collect()
    }

    /// Advance the round-robin cursor to the next usable account.
    pub fn next_round_robin(&self, key: &QuotaKey) -> Option<String> {
        let now = Utc::now();
        let mut inner = self.write();
        let len = inner.accounts.len();
        if len == 0 {
            return None;
        }
        for step in 1..=len {
            let idx = (inner.cursor + step) % len;
            if self.usable(&inner.accounts[idx], key, now) {
                inner.cursor = idx;
                return Some(inner.accounts[idx].email.clone());
            }
        }
        None
    }

    /// `true` when at least one candidate exists and every candidate
    /// (enabled, valid) is rate-limited on `key`.
    pub fn all_limited(&self, key: &QuotaKey) -> bool {
        let now = Utc::now();
        let inner = self.read();
        let mut candidates = 0usize;
        let mut limited = 0usize;
        for a in inner.accounts.iter().filter(|a| a.enabled && !a.invalid) {
            candidates += 1;
            if a.active_limit(key, now).is_some() {
                limited += 1;
            }
        }
        candidates > 0 && candidates == limited
    }

    /// Smallest remaining wait until some account's limit on `key`
    /// resets.
    pub fn min_wait(&self, key: &QuotaKey) -> Option<Duration> {
        let now = Utc::now();
        let inner = self.read();
        inner
            .accounts
            .iter()
            .filter(|a| a.enabled && !a.invalid)
            .filter_map(|a| a.active_limit(key, now))
            .map(|l| (l.reset_at - now).to_std().unwrap_or_default())
            .min()
    }

    // ── Metadata updates ──────────────────────────────────────────────────────

    pub fn set_project_id(&self, email: &str, project_id: &str) {
        {
            let mut inner = self.write();
            if let Some(a) = inner.accounts.iter_mut().find(|a| a.email == email) {
                a.project_id = Some(project_id.to_string());
            }
        }
        self.schedule_save();
    }

    pub fn set_subscription_tier(&self, email: &str, tier: SubscriptionTier) {
        {
            let mut inner = self.write();
            if let Some(a) = inner.accounts.iter_mut().find(|a| a.email == email) {
                a.subscription_tier = tier;
            }
        }
        self.schedule_save();
    }

    pub fn update_quota_snapshot(&self, email: &str, model: &str, snapshot: QuotaSnapshot) {
        {
            let mut inner = self.write();
            if let Some(a) = inner.accounts.iter_mut().find(|a| a.email == email) {
                a.quota_snapshot.insert(model.to_string(), snapshot);
            }
        }
        self.schedule_save();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
