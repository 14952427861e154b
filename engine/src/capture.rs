//! Change capture: advances the clock store when the base table is written.
//!
//! The capture path is an explicit state machine invoked by the replica's
//! write path after a local insert, update, or delete. The merge engine
//! writes rows through raw row storage instead, so replaying an
//! already-resolved remote change never re-triggers local clock advancement.

use crate::{
    ClockEntry, ClockStore, ColumnId, ColumnName, LogicalClock, PrimaryKey, TableInfo,
};

/// A local write observed on the base table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Row inserted; `written_columns` are the non-key columns whose value
    /// differs from the column default.
    Insert { written_columns: Vec<ColumnName> },
    /// Row updated; `changed_columns` are the non-key columns whose new
    /// value differs from the old one.
    Update { changed_columns: Vec<ColumnName> },
    /// Row deleted.
    Delete,
}

/// Advance the clock store for one local write.
///
/// Every entry written here is stamped with the transaction's frozen
/// `db_version` and the next `seq`, and carries `site_id = None` (local).
/// `col_version` increments only when the column's value actually changed,
/// which is what `written_columns`/`changed_columns` encode.
pub fn capture_write(
    clocks: &mut ClockStore,
    info: &TableInfo,
    clock: &mut LogicalClock,
    pk: &PrimaryKey,
    op: &WriteOp,
) {
    match op {
        WriteOp::Insert { written_columns } => {
            // A live insert supersedes any earlier tombstone for this key.
            clocks.remove(pk, &ColumnId::Delete);

            bump(clocks, clock, pk, ColumnId::Existence);
            for column in written_columns {
                debug_assert!(info.has_non_pk_column(column));
                bump(clocks, clock, pk, ColumnId::column(column.clone()));
            }
        }
        WriteOp::Update { changed_columns } => {
            for column in changed_columns {
                debug_assert!(info.has_non_pk_column(column));
                bump(clocks, clock, pk, ColumnId::column(column.clone()));
            }
        }
        WriteOp::Delete => {
            bump(clocks, clock, pk, ColumnId::Delete);
        }
    }
}

fn bump(clocks: &mut ClockStore, clock: &mut LogicalClock, pk: &PrimaryKey, column: ColumnId) {
    let col_version = clocks.get(pk, &column).map_or(1, |e| e.col_version + 1);
    let entry = ClockEntry {
        col_version,
        db_version: clock.current_version(),
        seq: clock.next_seq(),
        site_id: None,
    };
    clocks.put(pk.clone(), column, entry);
}
