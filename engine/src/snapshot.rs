//! Whole-replica state transfer: bootstrap a new node or back one up.
//!
//! A snapshot carries everything needed to resume replication: table
//! definitions, base rows, clock stores, the committed database version, and
//! per-peer watermarks. Transaction-scoped state is never part of it.

use crate::store::TableState;
use crate::{
    ClockStore, DbVersion, Error, LogicalClock, PrimaryKey, Replica, Result, Row, SiteId,
    TableDef, TableInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Bumped whenever the snapshot layout changes incompatibly.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Serializable image of one replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    pub format_version: u32,
    pub site_id: SiteId,
    pub db_version: DbVersion,
    pub peer_versions: BTreeMap<SiteId, DbVersion>,
    pub tables: Vec<TableSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    pub def: TableDef,
    pub rows: Vec<RowSnapshot>,
    /// Present iff the table is a CRR.
    pub clocks: Option<ClockStore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSnapshot {
    pub pk: PrimaryKey,
    pub columns: Row,
}

impl Replica {
    /// Export committed state. Fails while a transaction is open.
    pub fn export_state(&self) -> Result<ReplicaSnapshot> {
        if self.in_transaction() {
            return Err(Error::storage("cannot export state inside a transaction"));
        }
        let tables = self
            .tables
            .values()
            .map(|state| TableSnapshot {
                def: state.def.clone(),
                rows: state
                    .rows
                    .iter()
                    .map(|(pk, columns)| RowSnapshot {
                        pk: pk.clone(),
                        columns: columns.clone(),
                    })
                    .collect(),
                clocks: state.clocks.clone(),
            })
            .collect();
        Ok(ReplicaSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            site_id: self.site_id(),
            db_version: self.db_version(),
            peer_versions: self.peer_versions.clone(),
            tables,
        })
    }

    /// Reconstruct a replica from a snapshot, resuming the exported node's
    /// identity and clock. CRR table definitions are re-validated.
    pub fn import_state(snapshot: ReplicaSnapshot) -> Result<Replica> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported format version {}",
                snapshot.format_version
            )));
        }

        let mut tables = BTreeMap::new();
        for table in snapshot.tables {
            if tables.contains_key(&table.def.name) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate table '{}'",
                    table.def.name
                )));
            }
            if table.clocks.is_some() {
                TableInfo::introspect(&table.def)
                    .map_err(|err| Error::InvalidSnapshot(err.to_string()))?;
            }
            let name = table.def.name.clone();
            tables.insert(
                name,
                TableState {
                    def: table.def,
                    rows: table
                        .rows
                        .into_iter()
                        .map(|row| (row.pk, row.columns))
                        .collect(),
                    clocks: table.clocks,
                    capture_paused: false,
                },
            );
        }

        info!(
            site_id = %snapshot.site_id,
            db_version = snapshot.db_version,
            tables = tables.len(),
            "imported replica snapshot"
        );
        Ok(Replica::from_parts(
            LogicalClock::with_version(snapshot.site_id, snapshot.db_version),
            tables,
            snapshot.peer_versions,
        ))
    }
}
