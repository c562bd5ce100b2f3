// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Derived conversation sessions.
//!
//! A session is never persisted and never supplied by the client; it is
//! derived from the first user message so that replays of the same
//! conversation hash to the same handle.  The session pins the
//! conversation to one account (sticky selection) which keeps upstream
//! prompt caches warm.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Idle lifetime after which a session is forgotten.
const SESSION_TTL: Duration = Duration::from_secs(3600);
/// Hard cap on tracked sessions; oldest are evicted past this.
const MAX_SESSIONS: usize = 500;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub pinned_account: Option<String>,
    pub message_count: u32,
    pub tokens_consumed: u64,
    pub last_seen: DateTime<Utc>,
}

pub struct SessionTracker {
    sessions: Mutex<HashMap<String, Session>>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    /// Derive the deterministic session id for a conversation from its
    /// first user message.
    pub fn derive_id(first_user_text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"session:");
        hasher.update(first_user_text.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }

    /// Observe a request for `id` with the given message count.
    ///
    /// A session continues only while it is seen within the TTL and its
    /// message count never decreases; a shorter history under the same
    /// id is a fresh conversation that happens to share a first message,
    /// so the pin is dropped and counters restart.
    pub fn touch(&self, id: &str, message_count: u32) -> Session {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        let continues = sessions.get(id).is_some_and(|s| {
            let age = (now - s.last_seen).to_std().unwrap_or_default();
            age <= SESSION_TTL && message_count >= s.message_count
        });

        if !continues {
            if sessions.contains_key(id) {
                debug!(session = id, "session restarted (ttl or history reset)");
            }
            sessions.insert(
                id.to_string(),
                Session {
                    id: id.to_string(),
                    pinned_account: None,
                    message_count,
                    tokens_consumed: 0,
                    last_seen: now,
                },
            );
        } else if let Some(s) = sessions.get_mut(id) {
            s.message_count = message_count;
            s.last_seen = now;
        }

        if sessions.len() > MAX_SESSIONS {
            evict_oldest(&mut sessions);
        }

        sessions.get(id).cloned().expect("session just inserted")
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Pin `id` to `account` for subsequent sticky selection.
    pub fn pin(&self, id: &str, account: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = sessions.get_mut(id) {
            if s.pinned_account.as_deref() != Some(account) {
                debug!(session = id, account, "session pinned");
            }
            s.pinned_account = Some(account.to_string());
        }
    }

    /// Drop the pin so the next selection picks a fresh account.
    pub fn unpin(&self, id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = sessions.get_mut(id) {
            s.pinned_account = None;
        }
    }

    /// Add `tokens` to the session's consumption counter.
    pub fn record_tokens(&self, id: &str, tokens: u64) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = sessions.get_mut(id) {
            s.tokens_consumed += tokens;
        }
    }

    /// Forget sessions idle past the TTL.  Called from the periodic
    /// sweep task.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|_, s| {
            (now - s.last_seen).to_std().unwrap_or_default() <= SESSION_TTL
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_oldest(sessions: &mut HashMap<String, Session>) {
    // Copy keys first; the map cannot be mutated while iterating.
    while sessions.len() > MAX_SESSIONS {
        let oldest = sessions
            .values()
            .min_by_key(|s| s.last_seen)
            .map(|s| s.id.clone());
        match oldest {
            Some(id) => {
                debug!(session = %id, "evicting oldest session");
                sessions.remove(&id);
            }
            None => break,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_id_is_deterministic() {
        let a = SessionTracker::derive_id("hello world");
        let b = SessionTracker::derive_id("hello world");
        let c = SessionTracker::derive_id("hello there");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn touch_creates_and_continues() {
        let t = SessionTracker::new();
        let s = t.touch("s1", 1);
        assert_eq!(s.message_count, 1);
        assert!(s.pinned_account.is_none());

        t.pin("s1", "a@x");
        let s = t.touch("s1", 3);
        assert_eq!(s.message_count, 3);
        assert_eq!(s.pinned_account.as_deref(), Some("a@x"));
    }

    #[test]
    fn shrinking_history_restarts_session() {
        let t = SessionTracker::new();
        t.touch("s1", 5);
        t.pin("s1", "a@x");
        // Same first message, but a shorter history: a new conversation.
        let s = t.touch("s1", 1);
        assert_eq!(s.message_count, 1);
        assert!(s.pinned_account.is_none());
        assert_eq!(s.tokens_consumed, 0);
    }

    #[test]
    fn tokens_accumulate() {
        let t = SessionTracker::new();
        t.touch("s1", 1);
        t.record_tokens("s1", 100);
        t.record_tokens("s1", 50);
        assert_eq!(t.get("s1").unwrap().tokens_consumed, 150);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let t = SessionTracker::new();
        for i in 0..=MAX_SESSIONS {
            t.touch(&format!("s{i}"), 1);
        }
        assert_eq!(t.len(), MAX_SESSIONS);
        // s0 was the oldest insert and should be gone.
        assert!(t.get("s0").is_none());
        assert!(t.get(&format!("s{MAX_SESSIONS}")).is_some());
    }

    #[test]
    fn unpin_clears_pin() {
        let t = SessionTracker::new();
        t.touch("s1", 1);
        t.pin("s1", "a@x");
        t.unpin("s1");
        assert!(t.get("s1").unwrap().pinned_account.is_none());
    }
}
