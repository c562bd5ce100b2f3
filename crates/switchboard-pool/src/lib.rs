// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Upstream account pool: identities, per-(model, quota-class) rate
//! limits, concurrency permits, derived sessions, selection policies,
//! the reasoning-signature cache, and usage counters.

pub mod account;
pub mod persist;
pub mod pool;
pub mod selection;
pub mod session;
pub mod signature;
pub mod usage;

pub use account::{
    Account, Credential, LimitType, QuotaClass, QuotaKey, QuotaSnapshot, RateLimit,
    SubscriptionTier,
};
pub use pool::{AccountPool, Permit, PoolTuning};
pub use selection::{
    build_policy, Outcome, Selection, SelectionContext, SelectionPolicy,
};
pub use session::{Session, SessionTracker};
pub use signature::{SignatureCache, SWEEP_INTERVAL};
pub use usage::UsageHistory;
