// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Hour-bucketed request counters, persisted to `usage-history.json`.
//!
//! The file shape is one object per hour bucket:
//!
//! ```json
//! {
//!   "2026-08-01T13": {
//!     "gemini": { "gemini-3-pro-preview": 12, "_subtotal": 12 },
//!     "claude": { "claude-sonnet-4-5": 3, "_subtotal": 3 },
//!     "_total": 15
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::persist::{read_json, Saver};

/// Buckets older than this are pruned on every record.
const RETENTION_DAYS: i64 = 30;

type Buckets = BTreeMap<String, BTreeMap<String, BTreeMap<String, u64>>>;

pub struct UsageHistory {
    /// bucket → family → model → count (`_subtotal` / `_total` are
    /// folded in at serialisation time).
    buckets: Mutex<Buckets>,
    saver: Option<Arc<Saver>>,
}

impl Default for UsageHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageHistory {
    pub fn new() -> Self {
        Self { buckets: Mutex::new(BTreeMap::new()), saver: None }
    }

    pub fn with_persistence(path: PathBuf) -> anyhow::Result<Self> {
        let mut buckets = Buckets::new();
        if let Some(v) = read_json(&path)? {
            buckets = parse_persisted(&v);
            info!(buckets = buckets.len(), "loaded usage history");
        }
        Ok(Self { buckets: Mutex::new(buckets), saver: Some(Arc::new(Saver::new(path))) })
    }

    fn bucket_key(at: DateTime<Utc>) -> String {
        at.format("%Y-%m-%dT%H").to_string()
    }

    /// Count one request for `model` under `family`.
    pub fn record(&self, family: &str, model: &str) {
        self.record_at(family, model, Utc::now());
    }

    fn record_at(&self, family: &str, model: &str, at: DateTime<Utc>) {
        {
            let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
            let bucket = buckets.entry(Self::bucket_key(at)).or_default();
            *bucket
                .entry(family.to_string())
                .or_default()
                .entry(model.to_string())
                .or_insert(0) += 1;

            let cutoff = Self::bucket_key(at - Duration::days(RETENTION_DAYS));
            buckets.retain(|k, _| *k >= cutoff);
        }
        self.schedule_save();
    }

    /// Total requests recorded in the bucket containing `at`.
    pub fn total_in_hour(&self, at: DateTime<Utc>) -> u64 {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .get(&Self::bucket_key(at))
            .map(|families| families.values().flat_map(|m| m.values()).sum())
            .unwrap_or(0)
    }

    fn schedule_save(&self) {
        if let Some(saver) = &self.saver {
            saver.schedule(self.to_json());
        }
    }

    pub fn flush(&self) {
        if let Some(saver) = &self.saver {
            saver.flush_now(self.to_json());
        }
    }

    /// Persisted shape with `_subtotal` per family and `_total` per bucket.
    pub fn to_json(&self) -> serde_json::Value {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = serde_json::Map::new();
        for (bucket, families) in buckets.iter() {
            let mut bucket_obj = serde_json::Map::new();
            let mut total = 0u64;
            for (family, models) in families {
                let mut fam_obj = serde_json::Map::new();
                let mut subtotal = 0u64;
                for (model, count) in models {
                    fam_obj.insert(model.clone(), (*count).into());
                    subtotal += count;
                }
                fam_obj.insert("_subtotal".into(), subtotal.into());
                total += subtotal;
                bucket_obj.insert(family.clone(), fam_obj.into());
            }
            bucket_obj.insert("_total".into(), total.into());
            out.insert(bucket.clone(), bucket_obj.into());
        }
        out.into()
    }
}

fn parse_persisted(v: &serde_json::Value) -> Buckets {
    let mut buckets = Buckets::new();
    let Some(obj) = v.as_object() else { return buckets };
    for (bucket, families) in obj {
        let Some(families) = families.as_object() else { continue };
        let bucket_entry = buckets.entry(bucket.clone()).or_default();
        for (family, models) in families {
            if family == "_total" {
                continue;
            }
            let Some(models) = models.as_object() else { continue };
            let fam_entry = bucket_entry.entry(family.clone()).or_default();
            for (model, count) in models {
                if model == "_subtotal" {
                    continue;
                }
                if let Some(n) = count.as_u64() {
                    fam_entry.insert(model.clone(), n);
                }
            }
        }
    }
    buckets
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
