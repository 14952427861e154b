//! The change feed: assembling replicable change records from clock and row
//! state.
//!
//! Records are produced in `(db_version, seq)` order, which reproduces the
//! original local write order. A consumer pulls with `ChangesQuery::since`
//! using its stored watermark for the producing peer.

use crate::{
    ChangeRecord, ClockStore, ColumnId, DbVersion, PrimaryKey, Row, SiteId, TableName, Value,
    CAUSAL_LENGTH_ALIVE, CAUSAL_LENGTH_DELETED,
};
use std::collections::BTreeMap;

/// Filter over the change feed. The zero query returns everything.
#[derive(Debug, Clone, Default)]
pub struct ChangesQuery {
    since: Option<DbVersion>,
    excluding: Option<SiteId>,
    for_site: Option<SiteId>,
}

impl ChangesQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only changes with `db_version` strictly greater than the watermark.
    pub fn since(mut self, db_version: DbVersion) -> Self {
        self.since = Some(db_version);
        self
    }

    /// Skip changes that originated at the given site. Used when pushing to
    /// a peer to avoid echoing its own writes back.
    pub fn excluding(mut self, site_id: SiteId) -> Self {
        self.excluding = Some(site_id);
        self
    }

    /// Only changes that originated at the given site.
    pub fn for_site(mut self, site_id: SiteId) -> Self {
        self.for_site = Some(site_id);
        self
    }

    fn matches(&self, db_version: DbVersion, origin: SiteId) -> bool {
        if let Some(since) = self.since {
            if db_version <= since {
                return false;
            }
        }
        if self.excluding == Some(origin) {
            return false;
        }
        if let Some(wanted) = self.for_site {
            if origin != wanted {
                return false;
            }
        }
        true
    }
}

/// Assemble the matching change records of one CRR into `out`.
///
/// A tombstoned row contributes only its delete-sentinel record; the column
/// entries it retains are logically dead and never replicated.
pub(crate) fn collect_changes(
    table: &TableName,
    rows: &BTreeMap<PrimaryKey, Row>,
    clocks: &ClockStore,
    local_site: SiteId,
    query: &ChangesQuery,
    out: &mut Vec<ChangeRecord>,
) {
    for pk in clocks.keys() {
        let tombstoned = clocks.has_tombstone(pk);
        for (column_id, entry) in clocks.row_entries(pk) {
            if tombstoned && *column_id != ColumnId::Delete {
                continue;
            }
            let origin = entry.site_id.unwrap_or(local_site);
            if !query.matches(entry.db_version, origin) {
                continue;
            }
            let (value, causal_length) = match column_id {
                ColumnId::Delete => (Value::Null, CAUSAL_LENGTH_DELETED),
                ColumnId::Existence => (Value::Null, CAUSAL_LENGTH_ALIVE),
                ColumnId::Column(name) => {
                    let value = rows
                        .get(pk)
                        .and_then(|row| row.get(name))
                        .cloned()
                        .unwrap_or(Value::Null);
                    (value, CAUSAL_LENGTH_ALIVE)
                }
            };
            out.push(ChangeRecord {
                table: table.clone(),
                pk: pk.clone(),
                column_id: column_id.clone(),
                value,
                col_version: entry.col_version,
                db_version: entry.db_version,
                site_id: origin,
                seq: entry.seq,
                causal_length,
            });
        }
    }
}

/// Restore original write order across all tables of a replica.
pub(crate) fn sort_records(records: &mut [ChangeRecord]) {
    records.sort_by_key(|r| (r.db_version, r.seq));
}
