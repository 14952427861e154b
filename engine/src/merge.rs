//! The conflict-resolution algorithm applied when a remote change is
//! ingested.
//!
//! The decision procedure is commutative, associative, and idempotent by
//! construction: the same deterministic outcome regardless of application
//! order or duplicate delivery. A losing comparison is the normal
//! `Superseded` outcome, never an error.

use crate::{
    ChangeRecord, ClockEntry, ClockStore, ColumnId, LogicalClock, PrimaryKey, Row, SiteId,
    TableInfo, Value,
};
use std::collections::BTreeMap;
use tracing::trace;

/// Outcome of merging one incoming change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The incoming change won and was written to the base row and clock.
    Applied,
    /// Local state dominates; the incoming change was a no-op.
    Superseded,
}

impl MergeOutcome {
    /// Rows affected as reported by the change feed write path.
    pub fn rows_affected(&self) -> usize {
        match self {
            MergeOutcome::Applied => 1,
            MergeOutcome::Superseded => 0,
        }
    }
}

/// Merge one incoming change into local row and clock state.
///
/// The caller routes rows/clocks of the right CRR here; base-row writes go
/// through raw storage so local change capture never observes them.
pub(crate) fn merge_change(
    rows: &mut BTreeMap<PrimaryKey, Row>,
    clocks: &mut ClockStore,
    info: &TableInfo,
    clock: &mut LogicalClock,
    local_site: SiteId,
    rec: &ChangeRecord,
) -> MergeOutcome {
    // Local tombstones dominate unconditionally, clock values ignored.
    if clocks.has_tombstone(&rec.pk) {
        trace!(table = %info.name, column = %rec.column_id, "superseded by local tombstone");
        return MergeOutcome::Superseded;
    }

    let outcome = match &rec.column_id {
        ColumnId::Delete => {
            rows.remove(&rec.pk);
            write_winning_clock(clocks, clock, local_site, rec, ColumnId::Delete);
            MergeOutcome::Applied
        }
        ColumnId::Existence => merge_existence(rows, clocks, info, clock, local_site, rec),
        ColumnId::Column(name) if !info.has_non_pk_column(name) => {
            // The column no longer exists locally; only row existence can be
            // replicated, folded under the existence sentinel.
            merge_existence(rows, clocks, info, clock, local_site, rec)
        }
        ColumnId::Column(name) => {
            if remote_value_wins(rows, clocks, rec, name) {
                let row = ensure_row(rows, info, &rec.pk);
                row.insert(name.clone(), rec.value.clone());
                write_winning_clock(clocks, clock, local_site, rec, rec.column_id.clone());
                MergeOutcome::Applied
            } else {
                MergeOutcome::Superseded
            }
        }
    };

    trace!(table = %info.name, column = %rec.column_id, ?outcome, "merged change");
    outcome
}

/// The column-level conflict resolution of the CRR algorithm.
///
/// Higher `col_version` wins outright; equal versions tie-break on the
/// deterministic total value ordering, and the incoming value wins iff it is
/// strictly greater than the row's current stored value.
fn remote_value_wins(
    rows: &BTreeMap<PrimaryKey, Row>,
    clocks: &ClockStore,
    rec: &ChangeRecord,
    column: &str,
) -> bool {
    let local = match clocks.get(&rec.pk, &rec.column_id) {
        None => return true,
        Some(local) => local,
    };
    if rec.col_version != local.col_version {
        return rec.col_version > local.col_version;
    }
    let current = rows
        .get(&rec.pk)
        .and_then(|row| row.get(column))
        .cloned()
        .unwrap_or(Value::Null);
    rec.value > current
}

/// Sentinel merge: no value exists, so conflicts reduce to the version
/// counter. The row is materialized on primary key alone if absent.
fn merge_existence(
    rows: &mut BTreeMap<PrimaryKey, Row>,
    clocks: &mut ClockStore,
    info: &TableInfo,
    clock: &mut LogicalClock,
    local_site: SiteId,
    rec: &ChangeRecord,
) -> MergeOutcome {
    let wins = match clocks.get(&rec.pk, &ColumnId::Existence) {
        None => true,
        Some(local) => rec.col_version > local.col_version,
    };
    if !wins {
        return MergeOutcome::Superseded;
    }
    ensure_row(rows, info, &rec.pk);
    write_winning_clock(clocks, clock, local_site, rec, ColumnId::Existence);
    MergeOutcome::Applied
}

/// Insert-if-absent on primary key alone, every non-key column at its
/// deterministic default.
fn ensure_row<'a>(
    rows: &'a mut BTreeMap<PrimaryKey, Row>,
    info: &TableInfo,
    pk: &PrimaryKey,
) -> &'a mut Row {
    rows.entry(pk.clone()).or_insert_with(|| {
        info.columns
            .iter()
            .filter(|c| c.pk_ordinal.is_none())
            .map(|c| (c.name.clone(), c.default_value()))
            .collect()
    })
}

/// Write the winning clock. `db_version` takes the Lamport max of the
/// transaction's frozen commit version and the incoming version: an applied
/// change is always stamped past the node's previously committed version, so
/// peers that already pulled up to that version still see it. A transaction
/// that supersedes everything never gets here and commits on the observed
/// fold alone.
fn write_winning_clock(
    clocks: &mut ClockStore,
    clock: &mut LogicalClock,
    local_site: SiteId,
    rec: &ChangeRecord,
    column: ColumnId,
) {
    let db_version = clock.current_version().max(rec.db_version);
    clock.observe(db_version);
    let entry = ClockEntry {
        col_version: rec.col_version,
        db_version,
        seq: clock.next_seq(),
        site_id: if rec.site_id == local_site {
            None
        } else {
            Some(rec.site_id)
        },
    };
    clocks.put(rec.pk.clone(), column, entry);
}
