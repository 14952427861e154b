//! Site identity and the per-connection logical clock.
//!
//! The clock is the sole source of causal ordering across the engine: every
//! side effect that must be visible "no earlier than" another is stamped with
//! a `(db_version, seq)` pair drawn from it inside the same transaction.

use crate::{DbVersion, Seq};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable 16-byte node identity, generated once and persisted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SiteId(Uuid);

impl SiteId {
    /// Generate a fresh random site identity.
    pub fn generate() -> Self {
        SiteId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SiteId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-connection logical clock.
///
/// `db_version` is a Lamport counter: it advances at least once per committing
/// local transaction and is raised to the max of any externally observed
/// version on ingest. `pending` is the version the current open transaction
/// will commit to, frozen on first use. `seq` orders records within one
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalClock {
    site_id: SiteId,
    /// Last committed database version.
    db_version: DbVersion,
    /// Commit-target version of the open transaction, frozen on first use.
    #[serde(skip)]
    pending: Option<DbVersion>,
    /// Externally supplied lower bound for the next frozen version.
    #[serde(skip)]
    floor: DbVersion,
    /// Highest db_version ingested from remote origins this transaction.
    #[serde(skip)]
    observed: DbVersion,
    /// Per-transaction sequence counter.
    #[serde(skip)]
    seq: Seq,
}

impl LogicalClock {
    /// Create a clock for a node, starting at version 0.
    pub fn new(site_id: SiteId) -> Self {
        Self {
            site_id,
            db_version: 0,
            pending: None,
            floor: 0,
            observed: 0,
            seq: 0,
        }
    }

    /// Restore a clock from persisted identity and committed version.
    pub fn with_version(site_id: SiteId, db_version: DbVersion) -> Self {
        Self {
            db_version,
            ..Self::new(site_id)
        }
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Last committed database version.
    pub fn db_version(&self) -> DbVersion {
        self.db_version
    }

    /// The frozen commit-target version of the current transaction.
    ///
    /// Idempotent within a transaction: the first call freezes
    /// `max(db_version + 1, floor)` and every later call returns the same
    /// value until commit or rollback.
    pub fn current_version(&mut self) -> DbVersion {
        let init = (self.db_version + 1).max(self.floor);
        *self.pending.get_or_insert(init)
    }

    /// Advance the clock, honoring an externally supplied lower bound.
    pub fn next_db_version(&mut self, hint: Option<DbVersion>) -> DbVersion {
        if let Some(hint) = hint {
            self.floor = self.floor.max(hint);
        }
        let next = self
            .pending
            .unwrap_or(0)
            .max(self.db_version + 1)
            .max(self.floor);
        self.pending = Some(next);
        next
    }

    /// Return and post-increment the per-transaction sequence counter.
    pub fn next_seq(&mut self) -> Seq {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Fold an ingested remote version into the clock. The committed version
    /// never falls behind anything the node has ingested.
    pub fn observe(&mut self, db_version: DbVersion) {
        self.observed = self.observed.max(db_version);
    }

    /// Commit: pending becomes the committed version, raised to anything
    /// observed; transaction-scoped state is cleared.
    pub fn on_commit(&mut self) {
        self.db_version = self
            .pending
            .take()
            .unwrap_or(self.db_version)
            .max(self.observed);
        self.floor = 0;
        self.observed = 0;
        self.seq = 0;
    }

    /// Rollback: pending is discarded, the committed version is unchanged.
    pub fn on_rollback(&mut self) {
        self.pending = None;
        self.floor = 0;
        self.observed = 0;
        self.seq = 0;
    }
}
