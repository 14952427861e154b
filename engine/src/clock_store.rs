//! The shadow clock table kept alongside each CRR.
//!
//! One entry per (row, column) that has ever been written, plus sentinel
//! entries for row creation and deletion. Entries are never physically
//! deleted except by schema compaction after a column is dropped; a
//! delete-sentinel entry makes all non-sentinel entries for that primary key
//! logically dead.

use crate::{ColVersion, ColumnId, DbVersion, PrimaryKey, Seq, SiteId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Logical clock state for one (row, column) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockEntry {
    /// Per-column change counter; increments only when the value of the
    /// column actually changes relative to its prior locally-known value.
    pub col_version: ColVersion,
    pub db_version: DbVersion,
    pub seq: Seq,
    /// `None` means "authored locally by this node".
    pub site_id: Option<SiteId>,
}

/// Shadow table recording a logical clock per (row, column) of one CRR.
///
/// Serialized as a flat list of rows; keyed in memory for lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<ClockRow>", from = "Vec<ClockRow>")]
pub struct ClockStore {
    entries: BTreeMap<PrimaryKey, BTreeMap<ColumnId, ClockEntry>>,
}

/// Flat serialization form of one clock entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockRow {
    pub pk: PrimaryKey,
    pub column_id: ColumnId,
    #[serde(flatten)]
    pub entry: ClockEntry,
}

impl From<ClockStore> for Vec<ClockRow> {
    fn from(store: ClockStore) -> Self {
        store
            .iter()
            .map(|(pk, column_id, entry)| ClockRow {
                pk: pk.clone(),
                column_id: column_id.clone(),
                entry: entry.clone(),
            })
            .collect()
    }
}

impl From<Vec<ClockRow>> for ClockStore {
    fn from(rows: Vec<ClockRow>) -> Self {
        let mut store = ClockStore::new();
        for row in rows {
            store.put(row.pk, row.column_id, row.entry);
        }
        store
    }
}

impl ClockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pk: &PrimaryKey, column: &ColumnId) -> Option<&ClockEntry> {
        self.entries.get(pk)?.get(column)
    }

    /// Insert or replace the entry for (pk, column).
    pub fn put(&mut self, pk: PrimaryKey, column: ColumnId, entry: ClockEntry) {
        self.entries.entry(pk).or_default().insert(column, entry);
    }

    /// Remove a single entry, returning it if present.
    pub fn remove(&mut self, pk: &PrimaryKey, column: &ColumnId) -> Option<ClockEntry> {
        let row = self.entries.get_mut(pk)?;
        let entry = row.remove(column);
        if row.is_empty() {
            self.entries.remove(pk);
        }
        entry
    }

    /// Whether a delete-sentinel entry exists for this primary key.
    pub fn has_tombstone(&self, pk: &PrimaryKey) -> bool {
        self.get(pk, &ColumnId::Delete).is_some()
    }

    /// All entries for one row.
    pub fn row_entries(&self, pk: &PrimaryKey) -> impl Iterator<Item = (&ColumnId, &ClockEntry)> {
        self.entries.get(pk).into_iter().flatten()
    }

    /// All entries, in (pk, column) order.
    pub fn iter(&self) -> impl Iterator<Item = (&PrimaryKey, &ColumnId, &ClockEntry)> {
        self.entries
            .iter()
            .flat_map(|(pk, row)| row.iter().map(move |(col, entry)| (pk, col, entry)))
    }

    /// Primary keys with at least one entry.
    pub fn keys(&self) -> impl Iterator<Item = &PrimaryKey> {
        self.entries.keys()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(|row| row.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Column identifiers present for a row, cloned out so the caller can
    /// mutate the store while walking them.
    pub fn row_columns(&self, pk: &PrimaryKey) -> Vec<ColumnId> {
        self.row_entries(pk).map(|(col, _)| col.clone()).collect()
    }
}
