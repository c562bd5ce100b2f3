// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Coalesced JSON persistence.
//!
//! Every mutation schedules a save; at most one write is in flight per
//! file, with at most one more pending.  A burst of mutations therefore
//! costs two writes, not one per mutation.  Writes go through a temp
//! file + rename so readers never observe a torn file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

/// Write `value` to `path` atomically (temp file in the same directory,
/// then rename).
pub fn write_json_atomic(path: &Path, value: &serde_json::Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value).unwrap_or_default())?;
    std::fs::rename(&tmp, path)
}

/// Read and parse a JSON file, returning `None` when it does not exist.
pub fn read_json(path: &Path) -> anyhow::Result<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

enum SaverState {
    Idle,
    InFlight,
    /// A write is running and a newer snapshot is queued behind it.
    Pending(serde_json::Value),
}

/// One persisted file with coalesced asynchronous saves.
pub struct Saver {
    path: PathBuf,
    state: Mutex<SaverState>,
}

impl Saver {
    pub fn new(path: PathBuf) -> Self {
        Self { path, state: Mutex::new(SaverState::Idle) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schedule `snapshot` to be written.  If a write is already in
    /// flight the snapshot is queued, replacing any previously queued
    /// one (only the newest state matters).
    pub fn schedule(self: &std::sync::Arc<Self>, snapshot: serde_json::Value) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match &*state {
                SaverState::Idle => *state = SaverState::InFlight,
                SaverState::InFlight | SaverState::Pending(_) => {
                    *state = SaverState::Pending(snapshot);
                    return;
                }
            }
        }
        self.spawn_write(snapshot);
    }

    fn spawn_write(self: &std::sync::Arc<Self>, snapshot: serde_json::Value) {
        let this = std::sync::Arc::clone(self);
        let write = move || {
            let mut next = Some(snapshot);
            while let Some(value) = next.take() {
                if let Err(e) = write_json_atomic(&this.path, &value) {
                    warn!(path = %this.path.display(), error = %e, "state save failed");
                } else {
                    debug!(path = %this.path.display(), "state saved");
                }
                let mut state = this.state.lock().unwrap_or_else(|e| e.into_inner());
                match std::mem::replace(&mut *state, SaverState::Idle) {
                    SaverState::Pending(v) => {
                        *state = SaverState::InFlight;
                        next = Some(v);
                    }
                    _ => break,
                }
            }
        };

        // Outside a runtime (unit tests, shutdown paths) fall back to a
        // synchronous write.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    /// Synchronous best-effort flush used on shutdown.
    pub fn flush_now(&self, snapshot: serde_json::Value) {
        if let Err(e) = write_json_atomic(&self.path, &snapshot) {
            warn!(path = %self.path.display(), error = %e, "final flush failed");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &json!({ "a": 1 })).unwrap();
        let v = read_json(&path).unwrap().unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn read_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_json(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn schedule_outside_runtime_writes_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let saver = Arc::new(Saver::new(dir.path().join("s.json")));
        saver.schedule(json!({ "n": 1 }));
        let v = read_json(saver.path()).unwrap().unwrap();
        assert_eq!(v["n"], 1);
    }

    #[test]
    fn newest_snapshot_wins() {
        let dir = tempfile::tempdir().unwrap();
        let saver = Arc::new(Saver::new(dir.path().join("s.json")));
        saver.schedule(json!({ "n": 1 }));
        saver.schedule(json!({ "n": 2 }));
        let v = read_json(saver.path()).unwrap().unwrap();
        assert_eq!(v["n"], 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn schedule_inside_runtime_eventually_writes() {
        let dir = tempfile::tempdir().unwrap();
        let saver = Arc::new(Saver::new(dir.path().join("s.json")));
        saver.schedule(json!({ "n": 42 }));
        // spawn_blocking completes quickly; poll briefly.
        for _ in 0..50 {
            if saver.path().exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let v = read_json(saver.path()).unwrap().unwrap();
        assert_eq!(v["n"], 42);
    }
}
