//! Per-peer watermark tracking for the caller's sync protocol.
//!
//! During a transaction the tracker folds the highest `db_version` seen from
//! each remote origin in memory; at commit the result is flushed to durable
//! per-peer storage, clamped so a stored watermark never moves backward.

use crate::{DbVersion, SiteId};
use std::collections::BTreeMap;

/// In-memory max-per-site fold for the current transaction.
#[derive(Debug, Clone, Default)]
pub struct PeerWatermarkTracker {
    seen: BTreeMap<SiteId, DbVersion>,
}

impl PeerWatermarkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observed (origin, version) pair. O(distinct peers).
    pub fn observe(&mut self, site_id: SiteId, db_version: DbVersion) {
        let entry = self.seen.entry(site_id).or_insert(db_version);
        *entry = (*entry).max(db_version);
    }

    /// Upsert every tracked entry into durable storage. Commit only.
    pub fn flush(&self, store: &mut BTreeMap<SiteId, DbVersion>) {
        for (site_id, db_version) in &self.seen {
            let entry = store.entry(*site_id).or_insert(*db_version);
            *entry = (*entry).max(*db_version);
        }
    }

    /// Clear the in-memory map for the next transaction. Called on both
    /// commit and rollback.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
