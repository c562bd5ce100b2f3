// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Reasoning-signature cache.
//!
//! Clients routinely strip the opaque signatures from reasoning blocks
//! when replaying history.  The upstream rejects unsigned reasoning, so
//! the proxy remembers every signature it has seen in three keyed
//! stores and restores them during request translation:
//!
//!   1. tool-call id → signature (tool loops)
//!   2. signature → family (cross-family mixing detection)
//!   3. session id → latest signature (full-history strips)
//!
//! Each store is bounded and TTL'd; the whole cache persists to one
//! JSON file so restarts do not break in-flight tool loops.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::persist::{read_json, Saver};

/// Entry lifetime in every store.
const SIGNATURE_TTL: Duration = Duration::from_secs(3600);
/// How often the sweep task should run.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const TOOL_STORE_CAP: usize = 10_000;
const FAMILY_STORE_CAP: usize = 5_000;
const SESSION_STORE_CAP: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    timestamp: DateTime<Utc>,
}

/// One bounded store with oldest-insertion-first eviction.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Store {
    map: HashMap<String, Entry>,
    /// Insertion order; stale keys are skipped during eviction.
    order: VecDeque<String>,
}

impl Store {
    fn insert(&mut self, key: String, value: String, cap: usize) {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, Entry { value, timestamp: Utc::now() });
        while self.map.len() > cap {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn get(&self, key: &str, now: DateTime<Utc>) -> Option<&str> {
        let entry = self.map.get(key)?;
        let age = (now - entry.timestamp).to_std().unwrap_or_default();
        (age <= SIGNATURE_TTL).then_some(entry.value.as_str())
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.map.len();
        self.map.retain(|_, e| {
            (now - e.timestamp).to_std().unwrap_or_default() <= SIGNATURE_TTL
        });
        self.order.retain(|k| self.map.contains_key(k));
        before - self.map.len()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Stores {
    tool: Store,
    family: Store,
    session: Store,
}

pub struct SignatureCache {
    stores: Mutex<Stores>,
    saver: Option<Arc<Saver>>,
    dirty: std::sync::atomic::AtomicBool,
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureCache {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(Stores::default()),
            saver: None,
            dirty: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Open a cache backed by `path`, loading any previous contents.
    pub fn with_persistence(path: PathBuf) -> anyhow::Result<Self> {
        let mut stores = Stores::default();
        if let Some(v) = read_json(&path)? {
            stores = serde_json::from_value(v).unwrap_or_default();
            info!(
                tool = stores.tool.map.len(),
                family = stores.family.map.len(),
                session = stores.session.map.len(),
                "loaded signature cache"
            );
        }
        Ok(Self {
            stores: Mutex::new(stores),
            saver: Some(Arc::new(Saver::new(path))),
            dirty: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Stores> {
        self.stores.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    // ── Tool-call signatures ──────────────────────────────────────────────────

    pub fn cache_tool_signature(&self, tool_call_id: &str, signature: &str) {
        self.lock()
            .tool
            .insert(tool_call_id.into(), signature.into(), TOOL_STORE_CAP);
        self.mark_dirty();
    }

    pub fn tool_signature(&self, tool_call_id: &str) -> Option<String> {
        self.lock().tool.get(tool_call_id, Utc::now()).map(String::from)
    }

    // ── Signature families ────────────────────────────────────────────────────

    pub fn cache_signature_family(&self, signature: &str, family: &str) {
        self.lock()
            .family
            .insert(signature.into(), family.into(), FAMILY_STORE_CAP);
        self.mark_dirty();
    }

    pub fn signature_family(&self, signature: &str) -> Option<String> {
        self.lock().family.get(signature, Utc::now()).map(String::from)
    }

    // ── Per-session latest signature ──────────────────────────────────────────

    pub fn cache_session_signature(&self, session_id: &str, signature: &str) {
        self.lock()
            .session
            .insert(session_id.into(), signature.into(), SESSION_STORE_CAP);
        self.mark_dirty();
    }

    pub fn session_signature(&self, session_id: &str) -> Option<String> {
        self.lock().session.get(session_id, Utc::now()).map(String::from)
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    /// Remove expired entries from every store.
    pub fn sweep(&self) {
        let now = Utc::now();
        let removed = {
            let mut stores = self.lock();
            stores.tool.sweep(now) + stores.family.sweep(now) + stores.session.sweep(now)
        };
        if removed > 0 {
            debug!(removed, "signature cache sweep");
            self.mark_dirty();
            self.save();
        }
    }

    /// Schedule a save if anything changed.  No-op while clean; the
    /// saver coalesces concurrent calls.
    pub fn save(&self) {
        if !self.dirty.swap(false, std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        if let Some(saver) = &self.saver {
            let snapshot = serde_json::to_value(&*self.lock()).unwrap_or_default();
            saver.schedule(snapshot);
        }
    }

    /// Synchronous flush for shutdown.
    pub fn flush(&self) {
        if let Some(saver) = &self.saver {
            let snapshot = serde_json::to_value(&*self.lock()).unwrap_or_default();
            saver.flush_now(snapshot);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
