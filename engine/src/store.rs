//! The replica: a modeled relational store with change capture, ingest, and
//! transaction boundaries.
//!
//! Writes route through the capture state machine when the target table is a
//! CRR; ingest routes through the merge engine and never re-triggers capture.
//! Every operation runs inside a transaction: either one the caller opened
//! explicitly, or an implicit single-operation transaction.

use crate::capture::{capture_write, WriteOp};
use crate::feed::{collect_changes, sort_records, ChangesQuery};
use crate::merge::{merge_change, MergeOutcome};
use crate::{
    ChangeRecord, ClockEntry, ClockStore, ColumnDef, ColumnId, ColumnName, DbVersion, Error,
    LogicalClock, PrimaryKey, Result, Row, SchemaCache, SiteId, TableDef, TableName,
    PeerWatermarkTracker, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Storage and clock state of one table.
#[derive(Debug, Clone)]
pub(crate) struct TableState {
    pub(crate) def: TableDef,
    /// Non-key columns of each live row, keyed by packed primary key.
    pub(crate) rows: BTreeMap<PrimaryKey, Row>,
    /// Present iff the table is a CRR.
    pub(crate) clocks: Option<ClockStore>,
    /// Suspends change capture during a schema change.
    pub(crate) capture_paused: bool,
}

impl TableState {
    fn new(def: TableDef) -> Self {
        Self {
            def,
            rows: BTreeMap::new(),
            clocks: None,
            capture_paused: false,
        }
    }
}

/// One node's replica: tables, logical clock, and per-peer watermarks.
#[derive(Debug)]
pub struct Replica {
    pub(crate) clock: LogicalClock,
    pub(crate) tables: BTreeMap<TableName, TableState>,
    cache: SchemaCache,
    /// Durable high-water mark per remote origin, advanced at commit.
    pub(crate) peer_versions: BTreeMap<SiteId, DbVersion>,
    watermarks: PeerWatermarkTracker,
    /// Pre-transaction table image; `Some` while a transaction is open.
    undo: Option<BTreeMap<TableName, TableState>>,
}

impl Replica {
    /// A fresh replica with a generated site identity.
    pub fn new() -> Self {
        Self::with_site_id(SiteId::generate())
    }

    pub fn with_site_id(site_id: SiteId) -> Self {
        Self {
            clock: LogicalClock::new(site_id),
            tables: BTreeMap::new(),
            cache: SchemaCache::new(),
            peer_versions: BTreeMap::new(),
            watermarks: PeerWatermarkTracker::new(),
            undo: None,
        }
    }

    /// Reassemble a replica from persisted state.
    pub(crate) fn from_parts(
        clock: LogicalClock,
        tables: BTreeMap<TableName, TableState>,
        peer_versions: BTreeMap<SiteId, DbVersion>,
    ) -> Self {
        Self {
            clock,
            tables,
            cache: SchemaCache::new(),
            peer_versions,
            watermarks: PeerWatermarkTracker::new(),
            undo: None,
        }
    }

    pub fn site_id(&self) -> SiteId {
        self.clock.site_id()
    }

    /// Last committed database version of this node.
    pub fn db_version(&self) -> DbVersion {
        self.clock.db_version()
    }

    /// Advance the open transaction's commit-target version, honoring an
    /// external lower bound. See [`LogicalClock::next_db_version`].
    pub fn next_db_version(&mut self, hint: Option<DbVersion>) -> DbVersion {
        self.clock.next_db_version(hint)
    }

    /// Durable watermark for one peer, if any of its changes were ingested.
    pub fn peer_version(&self, site_id: SiteId) -> Option<DbVersion> {
        self.peer_versions.get(&site_id).copied()
    }

    // ---- schema ----

    pub fn create_table(&mut self, def: TableDef) -> Result<()> {
        if self.tables.contains_key(&def.name) {
            return Err(Error::storage(format!("table '{}' already exists", def.name)));
        }
        self.tables.insert(def.name.clone(), TableState::new(def));
        Ok(())
    }

    pub fn is_crr(&self, table: &str) -> bool {
        self.tables
            .get(table)
            .map_or(false, |state| state.clocks.is_some())
    }

    /// Promote a table to a CRR: validate eligibility, install the clock
    /// store, and backfill clock entries for every existing row as if it had
    /// just been inserted. Idempotent.
    pub fn make_crr(&mut self, table: &str) -> Result<()> {
        self.with_txn(|this| {
            let state = table_of(&this.tables, table)?;
            if state.clocks.is_some() {
                return Ok(());
            }
            let info = this.cache.table_info(&state.def)?;

            let backfill: Vec<(PrimaryKey, Vec<ColumnName>)> = state
                .rows
                .iter()
                .map(|(pk, row)| (pk.clone(), non_default_columns(&info.columns, row)))
                .collect();

            let mut clocks = ClockStore::new();
            for (pk, written_columns) in &backfill {
                capture_write(
                    &mut clocks,
                    &info,
                    &mut this.clock,
                    pk,
                    &WriteOp::Insert {
                        written_columns: written_columns.clone(),
                    },
                );
            }
            info!(table, rows = backfill.len(), "promoted table to crr");
            table_of_mut(&mut this.tables, table)?.clocks = Some(clocks);
            Ok(())
        })
    }

    /// Suspend change capture for a schema change on this table.
    pub fn begin_alter(&mut self, table: &str) -> Result<()> {
        self.table_mut(table)?.capture_paused = true;
        Ok(())
    }

    /// Add a non-key column. Requires an open schema change; existing rows
    /// are backfilled with the column default.
    pub fn add_column(&mut self, table: &str, column: ColumnDef) -> Result<()> {
        let state = self.table_mut(table)?;
        if !state.capture_paused {
            return Err(Error::storage("no schema change in progress"));
        }
        if column.pk_ordinal.is_some() {
            return Err(Error::storage("cannot add a primary key column"));
        }
        if state.def.column(&column.name).is_some() {
            return Err(Error::storage(format!(
                "table '{table}' already has column '{}'",
                column.name
            )));
        }
        let mut candidate = state.def.clone();
        candidate.columns.push(column.clone());
        if state.clocks.is_some() {
            // keep the table eligible; the failed alter leaves it unchanged
            crate::TableInfo::introspect(&candidate)?;
        }
        let default = column.default_value();
        for row in state.rows.values_mut() {
            row.insert(column.name.clone(), default.clone());
        }
        state.def = candidate;
        Ok(())
    }

    /// Drop a non-key column. Requires an open schema change; clock history
    /// for the column is compacted at `commit_alter`.
    pub fn drop_column(&mut self, table: &str, column: &str) -> Result<()> {
        let state = self.table_mut(table)?;
        if !state.capture_paused {
            return Err(Error::storage("no schema change in progress"));
        }
        let def = state
            .def
            .column(column)
            .ok_or_else(|| Error::storage(format!("table '{table}' has no column '{column}'")))?;
        if def.pk_ordinal.is_some() {
            return Err(Error::storage("cannot drop a primary key column"));
        }
        state.def.columns.retain(|c| c.name != column);
        for row in state.rows.values_mut() {
            row.remove(column);
        }
        Ok(())
    }

    /// Finish a schema change: fold clock entries of dropped columns into the
    /// row's existence marker, resume capture, and invalidate cached schema.
    pub fn commit_alter(&mut self, table: &str) -> Result<()> {
        let state = self.table_mut(table)?;
        if !state.capture_paused {
            return Err(Error::storage("no schema change in progress"));
        }
        if let Some(clocks) = state.clocks.as_mut() {
            let live: Vec<ColumnName> = state
                .def
                .columns
                .iter()
                .filter(|c| c.pk_ordinal.is_none())
                .map(|c| c.name.clone())
                .collect();
            let pks: Vec<PrimaryKey> = clocks.keys().cloned().collect();
            for pk in pks {
                for column_id in clocks.row_columns(&pk) {
                    let name = match &column_id {
                        ColumnId::Column(name) => name,
                        _ => continue,
                    };
                    if live.iter().any(|c| c == name) {
                        continue;
                    }
                    if let Some(dropped) = clocks.remove(&pk, &column_id) {
                        fold_into_existence(clocks, &pk, dropped);
                    }
                }
            }
        }
        state.capture_paused = false;
        self.cache.bump_generation();
        Ok(())
    }

    /// Replace a table's definition wholesale. The primary key must be
    /// unchanged. Dropped columns are removed from rows and their clock
    /// history compacted; added columns are backfilled with their default.
    pub fn alter_table(&mut self, table: &str, def: TableDef) -> Result<()> {
        let state = self.table(table)?;
        if def.name != table {
            return Err(Error::storage("altered definition renames the table"));
        }
        if def.pk_columns() != state.def.pk_columns() {
            return Err(Error::storage("cannot alter the primary key"));
        }
        if state.clocks.is_some() {
            crate::TableInfo::introspect(&def)?;
        }
        let added: Vec<ColumnDef> = def
            .columns
            .iter()
            .filter(|c| state.def.column(&c.name).is_none())
            .cloned()
            .collect();

        let state = self.table_mut(table)?;
        state.capture_paused = true;
        for row in state.rows.values_mut() {
            row.retain(|name, _| def.columns.iter().any(|c| c.name == *name));
            for col in &added {
                row.insert(col.name.clone(), col.default_value());
            }
        }
        state.def = def;
        self.commit_alter(table)
    }

    // ---- transactions ----

    pub fn in_transaction(&self) -> bool {
        self.undo.is_some()
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.undo.is_some() {
            return Err(Error::storage("transaction already open"));
        }
        self.start_transaction();
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.undo.is_none() {
            return Err(Error::storage("no open transaction"));
        }
        self.finish_commit();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if self.undo.is_none() {
            return Err(Error::storage("no open transaction"));
        }
        self.finish_rollback();
        Ok(())
    }

    fn start_transaction(&mut self) {
        self.undo = Some(self.tables.clone());
    }

    fn finish_commit(&mut self) {
        self.undo = None;
        self.clock.on_commit();
        self.watermarks.flush(&mut self.peer_versions);
        self.watermarks.reset();
    }

    fn finish_rollback(&mut self) {
        if let Some(saved) = self.undo.take() {
            self.tables = saved;
        }
        self.clock.on_rollback();
        self.watermarks.reset();
    }

    /// Run inside the open transaction, or an implicit one that commits on
    /// success and rolls back on error.
    fn with_txn<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.undo.is_some() {
            return f(self);
        }
        self.start_transaction();
        match f(self) {
            Ok(value) => {
                self.finish_commit();
                Ok(value)
            }
            Err(err) => {
                self.finish_rollback();
                Err(err)
            }
        }
    }

    // ---- writes ----

    /// Insert one row. Key columns are required; omitted non-key columns take
    /// their defaults. On a CRR this captures the row-creation marker plus
    /// one entry per column whose value differs from its default.
    pub fn insert<I, K, V>(&mut self, table: &str, columns: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<ColumnName>,
        V: Into<Value>,
    {
        let provided: BTreeMap<ColumnName, Value> = columns
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        self.with_txn(|this| {
            let state = table_of(&this.tables, table)?;
            for name in provided.keys() {
                if state.def.column(name).is_none() {
                    return Err(Error::storage(format!(
                        "table '{table}' has no column '{name}'"
                    )));
                }
            }

            let mut key = Vec::new();
            for pk_col in state.def.pk_columns() {
                match provided.get(&pk_col) {
                    Some(value) if !value.is_null() => key.push(value.clone()),
                    _ => {
                        return Err(Error::storage(format!(
                            "NOT NULL constraint failed: {table}.{pk_col}"
                        )))
                    }
                }
            }
            let pk = PrimaryKey::new(key);
            if state.rows.contains_key(&pk) {
                return Err(Error::storage(format!(
                    "UNIQUE constraint failed: {table} primary key"
                )));
            }

            let mut row = Row::new();
            let mut written_columns = Vec::new();
            for col in state.def.columns.iter().filter(|c| c.pk_ordinal.is_none()) {
                let default = col.default_value();
                let value = provided.get(&col.name).cloned().unwrap_or_else(|| default.clone());
                if col.not_null && value.is_null() {
                    return Err(Error::storage(format!(
                        "NOT NULL constraint failed: {table}.{}",
                        col.name
                    )));
                }
                if value != default {
                    written_columns.push(col.name.clone());
                }
                row.insert(col.name.clone(), value);
            }

            // eligibility only concerns promoted tables
            let info = if state.clocks.is_some() && !state.capture_paused {
                Some(this.cache.table_info(&state.def)?)
            } else {
                None
            };
            let state = table_of_mut(&mut this.tables, table)?;
            state.rows.insert(pk.clone(), row);
            if let (Some(info), Some(clocks)) = (info, state.clocks.as_mut()) {
                capture_write(
                    clocks,
                    &info,
                    &mut this.clock,
                    &pk,
                    &WriteOp::Insert { written_columns },
                );
            }
            Ok(())
        })
    }

    /// Update non-key columns of one row. Returns the number of rows
    /// affected; only columns whose value actually changed advance their
    /// clock entry.
    pub fn update<I, K, V>(
        &mut self,
        table: &str,
        pk: impl Into<PrimaryKey>,
        changes: I,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<ColumnName>,
        V: Into<Value>,
    {
        let pk = pk.into();
        let changes: BTreeMap<ColumnName, Value> = changes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        self.with_txn(|this| {
            let state = table_of(&this.tables, table)?;
            for (name, value) in &changes {
                let col = state.def.column(name).ok_or_else(|| {
                    Error::storage(format!("table '{table}' has no column '{name}'"))
                })?;
                if col.pk_ordinal.is_some() {
                    return Err(Error::storage(format!(
                        "cannot update primary key column '{name}'"
                    )));
                }
                if col.not_null && value.is_null() {
                    return Err(Error::storage(format!(
                        "NOT NULL constraint failed: {table}.{name}"
                    )));
                }
            }
            if !state.rows.contains_key(&pk) {
                return Ok(0);
            }

            let info = if state.clocks.is_some() && !state.capture_paused {
                Some(this.cache.table_info(&state.def)?)
            } else {
                None
            };
            let state = table_of_mut(&mut this.tables, table)?;
            let row = state
                .rows
                .get_mut(&pk)
                .ok_or_else(|| Error::storage("row vanished during update"))?;
            let mut changed_columns = Vec::new();
            for (name, value) in changes {
                if row.get(&name) != Some(&value) {
                    row.insert(name.clone(), value);
                    changed_columns.push(name);
                }
            }

            if !changed_columns.is_empty() {
                if let (Some(info), Some(clocks)) = (info, state.clocks.as_mut()) {
                    capture_write(
                        clocks,
                        &info,
                        &mut this.clock,
                        &pk,
                        &WriteOp::Update { changed_columns },
                    );
                }
            }
            Ok(1)
        })
    }

    /// Delete one row, writing a tombstone on a CRR. Returns the number of
    /// rows affected.
    pub fn delete(&mut self, table: &str, pk: impl Into<PrimaryKey>) -> Result<usize> {
        let pk = pk.into();
        self.with_txn(|this| {
            let info = {
                let state = table_of(&this.tables, table)?;
                if state.clocks.is_some() && !state.capture_paused {
                    Some(this.cache.table_info(&state.def)?)
                } else {
                    None
                }
            };
            let state = table_of_mut(&mut this.tables, table)?;
            if state.rows.remove(&pk).is_none() {
                return Ok(0);
            }
            if let (Some(info), Some(clocks)) = (info, state.clocks.as_mut()) {
                capture_write(clocks, &info, &mut this.clock, &pk, &WriteOp::Delete);
            }
            Ok(1)
        })
    }

    // ---- reads ----

    /// One row by primary key, with key columns included.
    pub fn row(&self, table: &str, pk: impl Into<PrimaryKey>) -> Result<Option<Row>> {
        let state = self.table(table)?;
        let pk = pk.into();
        Ok(state.rows.get(&pk).map(|row| assemble(&state.def, &pk, row)))
    }

    /// All rows in primary-key order, with key columns included.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let state = self.table(table)?;
        Ok(state
            .rows
            .iter()
            .map(|(pk, row)| assemble(&state.def, pk, row))
            .collect())
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.table(table)?.rows.len())
    }

    // ---- replication ----

    /// Read the change feed across all CRRs, ordered by `(db_version, seq)`.
    pub fn changes(&self, query: ChangesQuery) -> Result<Vec<ChangeRecord>> {
        let mut out = Vec::new();
        for (name, state) in &self.tables {
            if let Some(clocks) = &state.clocks {
                collect_changes(name, &state.rows, clocks, self.site_id(), &query, &mut out);
            }
        }
        sort_records(&mut out);
        Ok(out)
    }

    /// Convenience form of [`Replica::changes`]: everything strictly newer
    /// than `since`, optionally excluding one origin.
    pub fn changes_since(
        &self,
        since: DbVersion,
        exclude: Option<SiteId>,
    ) -> Result<Vec<ChangeRecord>> {
        let mut query = ChangesQuery::new().since(since);
        if let Some(site_id) = exclude {
            query = query.excluding(site_id);
        }
        self.changes(query)
    }

    /// Ingest a single change record. See [`Replica::apply_changes`].
    pub fn apply_change(&mut self, record: &ChangeRecord) -> Result<MergeOutcome> {
        let infos = self.validate_batch(std::slice::from_ref(record))?;
        let local_site = self.site_id();
        self.with_txn(|this| this.merge_one(&infos, local_site, record))
    }

    /// Ingest a batch of change records from a peer.
    ///
    /// The whole batch is validated up front and applied in one transaction:
    /// any malformed record or unknown table fails the batch with no effect.
    /// Returns how many records won their merge; superseded records still
    /// advance the clock and the origin's watermark.
    pub fn apply_changes(&mut self, records: &[ChangeRecord]) -> Result<usize> {
        let infos = self.validate_batch(records)?;
        let local_site = self.site_id();
        self.with_txn(|this| {
            let mut applied = 0;
            for rec in records {
                applied += this.merge_one(&infos, local_site, rec)?.rows_affected();
            }
            debug!(records = records.len(), applied, "applied change batch");
            Ok(applied)
        })
    }

    fn validate_batch(
        &mut self,
        records: &[ChangeRecord],
    ) -> Result<BTreeMap<TableName, Arc<crate::TableInfo>>> {
        let mut infos: BTreeMap<TableName, Arc<crate::TableInfo>> = BTreeMap::new();
        for rec in records {
            let state = table_of(&self.tables, &rec.table)?;
            if state.clocks.is_none() {
                return Err(Error::storage(format!(
                    "table '{}' is not a crr",
                    rec.table
                )));
            }
            if !infos.contains_key(&rec.table) {
                let info = self.cache.table_info(&state.def)?;
                infos.insert(rec.table.clone(), info);
            }
            let info = &infos[&rec.table];
            if rec.pk.len() != info.pk_columns.len() {
                return Err(Error::malformed(format!(
                    "primary key has {} values, table '{}' has {} key columns",
                    rec.pk.len(),
                    rec.table,
                    info.pk_columns.len()
                )));
            }
            if rec.pk.values().iter().any(Value::is_null) {
                return Err(Error::malformed(format!(
                    "null primary key component for table '{}'",
                    rec.table
                )));
            }
            if let ColumnId::Column(name) = &rec.column_id {
                if info.pk_columns.iter().any(|c| c == name) {
                    return Err(Error::malformed(format!(
                        "change targets primary key column '{name}'"
                    )));
                }
                // locally dropped columns fold to existence; no value to check
                if let Some(col) = info.column(name) {
                    if !col.column_type.admits(&rec.value) {
                        return Err(Error::malformed(format!(
                            "value for column '{}.{name}' is not {}",
                            rec.table, col.column_type
                        )));
                    }
                }
            }
        }
        Ok(infos)
    }

    /// Feed one pre-validated record through the watermark tracker, the
    /// clock, and the merge engine.
    fn merge_one(
        &mut self,
        infos: &BTreeMap<TableName, Arc<crate::TableInfo>>,
        local_site: SiteId,
        rec: &ChangeRecord,
    ) -> Result<MergeOutcome> {
        if rec.site_id != local_site {
            self.watermarks.observe(rec.site_id, rec.db_version);
        }
        self.clock.observe(rec.db_version);

        let state = self
            .tables
            .get_mut(&rec.table)
            .ok_or_else(|| Error::storage(format!("no such table: {}", rec.table)))?;
        let info = infos
            .get(&rec.table)
            .ok_or_else(|| Error::storage(format!("no such table: {}", rec.table)))?;
        let TableState { rows, clocks, .. } = state;
        let clocks = clocks
            .as_mut()
            .ok_or_else(|| Error::storage(format!("table '{}' is not a crr", rec.table)))?;
        Ok(merge_change(
            rows,
            clocks,
            info,
            &mut self.clock,
            local_site,
            rec,
        ))
    }

    // ---- helpers ----

    fn table(&self, table: &str) -> Result<&TableState> {
        table_of(&self.tables, table)
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut TableState> {
        table_of_mut(&mut self.tables, table)
    }
}

// Field-scoped lookups so callers can hold a table borrow alongside the
// clock or schema cache.
fn table_of<'a>(tables: &'a BTreeMap<TableName, TableState>, table: &str) -> Result<&'a TableState> {
    tables
        .get(table)
        .ok_or_else(|| Error::storage(format!("no such table: {table}")))
}

fn table_of_mut<'a>(
    tables: &'a mut BTreeMap<TableName, TableState>,
    table: &str,
) -> Result<&'a mut TableState> {
    tables
        .get_mut(table)
        .ok_or_else(|| Error::storage(format!("no such table: {table}")))
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// Join key columns back onto a stored row for the caller.
fn assemble(def: &TableDef, pk: &PrimaryKey, stored: &Row) -> Row {
    let mut row = stored.clone();
    for (name, value) in def.pk_columns().iter().zip(pk.values()) {
        row.insert(name.clone(), value.clone());
    }
    row
}

/// Non-key columns whose stored value differs from the column default.
fn non_default_columns(columns: &[ColumnDef], row: &Row) -> Vec<ColumnName> {
    columns
        .iter()
        .filter(|c| c.pk_ordinal.is_none())
        .filter(|c| row.get(&c.name).map_or(false, |v| *v != c.default_value()))
        .map(|c| c.name.clone())
        .collect()
}

/// Fold the clock entry of a dropped column into the row's existence marker
/// so row liveness survives the column's history being compacted away.
fn fold_into_existence(clocks: &mut ClockStore, pk: &PrimaryKey, dropped: ClockEntry) {
    let merged = match clocks.get(pk, &ColumnId::Existence) {
        Some(existing) => ClockEntry {
            col_version: existing.col_version.max(dropped.col_version),
            db_version: existing.db_version.max(dropped.db_version),
            seq: existing.seq.max(dropped.seq),
            site_id: if existing.db_version >= dropped.db_version {
                existing.site_id
            } else {
                dropped.site_id
            },
        },
        None => dropped,
    };
    clocks.put(pk.clone(), ColumnId::Existence, merged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ColumnType, CAUSAL_LENGTH_DELETED};

    fn todos_def() -> TableDef {
        TableDef::new(
            "todos",
            vec![
                ColumnDef::primary_key("id", ColumnType::Integer),
                ColumnDef::nullable("title", ColumnType::Text),
                ColumnDef::not_null_with_default("done", ColumnType::Integer, Value::Integer(0)),
            ],
        )
    }

    fn replica_at(seed: u8) -> Replica {
        let mut replica = Replica::with_site_id(SiteId::from_bytes([seed; 16]));
        replica.create_table(todos_def()).unwrap();
        replica.make_crr("todos").unwrap();
        replica
    }

    fn replica() -> Replica {
        replica_at(1)
    }

    fn pk(n: i64) -> PrimaryKey {
        PrimaryKey::new(vec![Value::Integer(n)])
    }

    #[test]
    fn insert_and_read_back() {
        let mut replica = replica();
        replica
            .insert("todos", [("id", Value::Integer(1)), ("title", Value::text("buy milk"))])
            .unwrap();

        let row = replica.row("todos", vec![Value::Integer(1)]).unwrap().unwrap();
        assert_eq!(row.get("id"), Some(&Value::Integer(1)));
        assert_eq!(row.get("title"), Some(&Value::text("buy milk")));
        // omitted column holds its default
        assert_eq!(row.get("done"), Some(&Value::Integer(0)));
        assert_eq!(replica.db_version(), 1);
    }

    #[test]
    fn duplicate_primary_key_rejected() {
        let mut replica = replica();
        replica.insert("todos", [("id", Value::Integer(1))]).unwrap();
        let err = replica
            .insert("todos", [("id", Value::Integer(1))])
            .unwrap_err();
        assert!(err.to_string().contains("UNIQUE constraint failed"));
        // failed implicit transaction leaves the clock unchanged
        assert_eq!(replica.db_version(), 1);
    }

    #[test]
    fn missing_key_column_rejected() {
        let mut replica = replica();
        let err = replica
            .insert("todos", [("title", Value::text("no id"))])
            .unwrap_err();
        assert!(err.to_string().contains("NOT NULL constraint failed: todos.id"));
    }

    #[test]
    fn insert_captures_only_non_default_columns() {
        let mut replica = replica();
        replica
            .insert(
                "todos",
                [
                    ("id", Value::Integer(1)),
                    ("title", Value::text("t")),
                    ("done", Value::Integer(0)),
                ],
            )
            .unwrap();

        let records = replica.changes(ChangesQuery::new()).unwrap();
        // existence + title; "done" matched its default
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].column_id, ColumnId::Existence);
        assert_eq!(records[1].column_id, ColumnId::column("title"));
        assert_eq!(records[1].col_version, 1);
    }

    #[test]
    fn update_ignores_no_op_assignments() {
        let mut replica = replica();
        replica
            .insert("todos", [("id", Value::Integer(1)), ("title", Value::text("t"))])
            .unwrap();

        let affected = replica
            .update("todos", pk(1), [("title", Value::text("t"))])
            .unwrap();
        assert_eq!(affected, 1);
        // value unchanged, so neither clock nor feed advanced
        assert_eq!(replica.db_version(), 1);
        let records = replica.changes(ChangesQuery::new()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn update_of_missing_row_affects_nothing() {
        let mut replica = replica();
        let affected = replica
            .update("todos", pk(9), [("title", Value::text("t"))])
            .unwrap();
        assert_eq!(affected, 0);
        assert_eq!(replica.db_version(), 0);
    }

    #[test]
    fn delete_emits_tombstone() {
        let mut replica = replica();
        replica
            .insert("todos", [("id", Value::Integer(1)), ("title", Value::text("t"))])
            .unwrap();
        assert_eq!(replica.delete("todos", pk(1)).unwrap(), 1);

        assert_eq!(replica.row_count("todos").unwrap(), 0);
        let records = replica.changes(ChangesQuery::new()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_tombstone());
        assert_eq!(records[0].causal_length, CAUSAL_LENGTH_DELETED);
    }

    #[test]
    fn explicit_transaction_shares_one_db_version() {
        let mut replica = replica();
        replica.begin_transaction().unwrap();
        replica.insert("todos", [("id", Value::Integer(1))]).unwrap();
        replica.insert("todos", [("id", Value::Integer(2))]).unwrap();
        replica.commit().unwrap();

        assert_eq!(replica.db_version(), 1);
        let records = replica.changes(ChangesQuery::new()).unwrap();
        assert!(records.iter().all(|r| r.db_version == 1));
    }

    #[test]
    fn rollback_restores_rows_and_clock() {
        let mut replica = replica();
        replica.insert("todos", [("id", Value::Integer(1))]).unwrap();

        replica.begin_transaction().unwrap();
        replica.insert("todos", [("id", Value::Integer(2))]).unwrap();
        replica.delete("todos", pk(1)).unwrap();
        replica.rollback().unwrap();

        assert_eq!(replica.row_count("todos").unwrap(), 1);
        assert_eq!(replica.db_version(), 1);
        assert_eq!(replica.changes(ChangesQuery::new()).unwrap().len(), 1);
    }

    #[test]
    fn nested_begin_rejected() {
        let mut replica = replica();
        replica.begin_transaction().unwrap();
        assert!(replica.begin_transaction().is_err());
        replica.rollback().unwrap();
        assert!(replica.commit().is_err());
    }

    #[test]
    fn make_crr_backfills_existing_rows() {
        let mut replica = Replica::with_site_id(SiteId::from_bytes([1; 16]));
        replica.create_table(todos_def()).unwrap();
        replica
            .insert("todos", [("id", Value::Integer(1)), ("title", Value::text("t"))])
            .unwrap();
        replica
            .insert("todos", [("id", Value::Integer(2)), ("done", Value::Integer(1))])
            .unwrap();
        // plain table: no clock movement yet
        assert_eq!(replica.db_version(), 0);

        replica.make_crr("todos").unwrap();
        assert!(replica.is_crr("todos"));
        assert_eq!(replica.db_version(), 1);

        let records = replica.changes(ChangesQuery::new()).unwrap();
        // existence per row plus one non-default column each
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.db_version == 1));

        // idempotent
        replica.make_crr("todos").unwrap();
        assert_eq!(replica.changes(ChangesQuery::new()).unwrap().len(), 4);
    }

    #[test]
    fn make_crr_rejects_ineligible_table() {
        let mut replica = Replica::new();
        let def = TableDef::new(
            "logs",
            vec![ColumnDef::nullable("line", ColumnType::Text)],
        );
        replica.create_table(def).unwrap();
        let err = replica.make_crr("logs").unwrap_err();
        assert!(matches!(err, Error::IncompatibleSchema { .. }));
        assert!(!replica.is_crr("logs"));
    }

    #[test]
    fn plain_table_writes_skip_crr_eligibility() {
        let mut replica = Replica::new();
        let def = TableDef::new(
            "users",
            vec![
                ColumnDef::primary_key("id", ColumnType::Integer),
                ColumnDef::nullable("email", ColumnType::Text),
            ],
        )
        .with_unique_index(vec!["email".to_string()]);
        // ineligible as a CRR, but a perfectly fine plain table
        replica.create_table(def).unwrap();

        replica
            .insert("users", [("id", Value::Integer(1)), ("email", Value::text("a@example.com"))])
            .unwrap();
        let affected = replica
            .update("users", pk(1), [("email", Value::text("b@example.com"))])
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(replica.delete("users", pk(1)).unwrap(), 1);

        // never promoted: no clock movement, and promotion still fails
        assert_eq!(replica.db_version(), 0);
        assert!(matches!(
            replica.make_crr("users").unwrap_err(),
            Error::IncompatibleSchema { .. }
        ));
    }

    #[test]
    fn apply_changes_rejects_mistyped_value() {
        let mut a = replica();
        a.insert("todos", [("id", Value::Integer(1)), ("title", Value::text("t"))])
            .unwrap();
        let mut records = a.changes(ChangesQuery::new()).unwrap();
        // title is declared Text
        records[1].value = Value::Integer(7);

        let mut b = replica_at(2);
        let err = b.apply_changes(&records).unwrap_err();
        assert!(matches!(err, Error::MalformedChangeRecord(_)));
        assert_eq!(b.row_count("todos").unwrap(), 0);
    }

    #[test]
    fn apply_changes_rejects_malformed_batch_atomically() {
        let mut a = replica();
        a.insert("todos", [("id", Value::Integer(1)), ("title", Value::text("t"))])
            .unwrap();
        let mut records = a.changes(ChangesQuery::new()).unwrap();
        records[1].pk = PrimaryKey::new(vec![Value::Integer(1), Value::Integer(2)]);

        let mut b = replica();
        let err = b.apply_changes(&records).unwrap_err();
        assert!(matches!(err, Error::MalformedChangeRecord(_)));
        // nothing landed, not even the well-formed first record
        assert_eq!(b.row_count("todos").unwrap(), 0);
        assert_eq!(b.db_version(), 0);
    }

    #[test]
    fn apply_changes_requires_crr_table() {
        let mut a = replica();
        a.insert("todos", [("id", Value::Integer(1))]).unwrap();
        let records = a.changes(ChangesQuery::new()).unwrap();

        let mut b = Replica::new();
        b.create_table(todos_def()).unwrap();
        let err = b.apply_changes(&records).unwrap_err();
        assert!(err.to_string().contains("not a crr"));
    }

    #[test]
    fn watermark_advances_on_commit_only() {
        let mut a = replica();
        a.insert("todos", [("id", Value::Integer(1)), ("title", Value::text("t"))])
            .unwrap();
        let records = a.changes(ChangesQuery::new()).unwrap();

        // distinct site id: records from one's own site never feed the tracker
        let mut b = replica_at(2);
        b.begin_transaction().unwrap();
        b.apply_changes(&records).unwrap();
        assert_eq!(b.peer_version(a.site_id()), None);
        b.commit().unwrap();
        assert_eq!(b.peer_version(a.site_id()), Some(1));
    }

    #[test]
    fn watermark_discarded_on_rollback() {
        let mut a = replica();
        a.insert("todos", [("id", Value::Integer(1))]).unwrap();
        let records = a.changes(ChangesQuery::new()).unwrap();

        let mut b = replica_at(2);
        b.begin_transaction().unwrap();
        b.apply_changes(&records).unwrap();
        assert_eq!(b.peer_version(a.site_id()), None);
        b.rollback().unwrap();
        assert_eq!(b.peer_version(a.site_id()), None);
        assert_eq!(b.row_count("todos").unwrap(), 0);
    }

    #[test]
    fn add_column_backfills_default() {
        let mut replica = replica();
        replica.insert("todos", [("id", Value::Integer(1))]).unwrap();

        replica.begin_alter("todos").unwrap();
        replica
            .add_column(
                "todos",
                ColumnDef::not_null_with_default("priority", ColumnType::Integer, Value::Integer(3)),
            )
            .unwrap();
        replica.commit_alter("todos").unwrap();

        let row = replica.row("todos", pk(1)).unwrap().unwrap();
        assert_eq!(row.get("priority"), Some(&Value::Integer(3)));
        // backfill is schema work, not a captured write
        assert_eq!(replica.changes(ChangesQuery::new()).unwrap().len(), 1);
    }

    #[test]
    fn add_column_requires_open_alter() {
        let mut replica = replica();
        let err = replica
            .add_column("todos", ColumnDef::nullable("x", ColumnType::Text))
            .unwrap_err();
        assert!(err.to_string().contains("no schema change in progress"));
    }

    #[test]
    fn add_ineligible_column_rejected_and_table_unchanged() {
        let mut replica = replica();
        replica.begin_alter("todos").unwrap();
        let bad = ColumnDef {
            name: "strict".to_string(),
            column_type: ColumnType::Text,
            not_null: true,
            default: None,
            pk_ordinal: None,
            autoincrement: false,
        };
        let err = replica.add_column("todos", bad).unwrap_err();
        assert!(matches!(err, Error::IncompatibleSchema { .. }));
        replica.commit_alter("todos").unwrap();
        assert!(replica.insert("todos", [("id", Value::Integer(1))]).is_ok());
    }

    #[test]
    fn drop_column_compacts_history_into_existence() {
        let mut replica = replica();
        replica
            .insert("todos", [("id", Value::Integer(1)), ("title", Value::text("t"))])
            .unwrap();
        replica
            .update("todos", pk(1), [("title", Value::text("tt"))])
            .unwrap();

        replica.begin_alter("todos").unwrap();
        replica.drop_column("todos", "title").unwrap();
        replica.commit_alter("todos").unwrap();

        let records = replica.changes(ChangesQuery::new()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].column_id, ColumnId::Existence);
        // existence carries the max of the compacted history
        assert_eq!(records[0].col_version, 2);
        assert_eq!(records[0].db_version, 2);
        assert!(replica.row("todos", pk(1)).unwrap().unwrap().get("title").is_none());
    }

    #[test]
    fn drop_primary_key_column_rejected() {
        let mut replica = replica();
        replica.begin_alter("todos").unwrap();
        let err = replica.drop_column("todos", "id").unwrap_err();
        assert!(err.to_string().contains("cannot drop a primary key column"));
    }

    #[test]
    fn writes_while_altering_are_not_captured() {
        let mut replica = replica();
        replica.begin_alter("todos").unwrap();
        replica.insert("todos", [("id", Value::Integer(1))]).unwrap();
        replica.commit_alter("todos").unwrap();

        assert_eq!(replica.row_count("todos").unwrap(), 1);
        assert!(replica.changes(ChangesQuery::new()).unwrap().is_empty());
    }
}
