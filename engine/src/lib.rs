//! Conflict-free replicated relations over a modeled relational store.
//!
//! Tables are promoted to CRRs with [`Replica::make_crr`]. From then on every
//! local write is captured as per-column logical clock state, readable as an
//! ordered change feed and ingestible on any other replica. Merging is
//! deterministic: replicas that have seen the same set of changes hold the
//! same rows, regardless of delivery order or duplication.
//!
//! ```
//! use crr_engine::{ChangesQuery, ColumnDef, ColumnType, Replica, TableDef, Value};
//!
//! # fn main() -> crr_engine::Result<()> {
//! let def = TableDef::new(
//!     "todos",
//!     vec![
//!         ColumnDef::primary_key("id", ColumnType::Integer),
//!         ColumnDef::nullable("title", ColumnType::Text),
//!     ],
//! );
//!
//! let mut alice = Replica::new();
//! alice.create_table(def.clone())?;
//! alice.make_crr("todos")?;
//! alice.insert(
//!     "todos",
//!     [("id", Value::Integer(1)), ("title", Value::text("buy milk"))],
//! )?;
//!
//! let mut bob = Replica::new();
//! bob.create_table(def)?;
//! bob.make_crr("todos")?;
//! let applied = bob.apply_changes(&alice.changes(ChangesQuery::new())?)?;
//! assert_eq!(applied, 2);
//!
//! let row = bob.row("todos", vec![Value::Integer(1)])?.unwrap();
//! assert_eq!(row.get("title"), Some(&Value::text("buy milk")));
//! # Ok(())
//! # }
//! ```

mod capture;
mod change;
mod clock;
mod clock_store;
mod error;
mod feed;
mod merge;
mod schema;
mod snapshot;
mod store;
mod value;
mod watermark;

pub use capture::{capture_write, WriteOp};
pub use change::{ChangeRecord, ColumnId, CAUSAL_LENGTH_ALIVE, CAUSAL_LENGTH_DELETED};
pub use clock::{LogicalClock, SiteId};
pub use clock_store::{ClockEntry, ClockRow, ClockStore};
pub use error::{Error, Result};
pub use feed::ChangesQuery;
pub use merge::MergeOutcome;
pub use schema::{ColumnDef, ColumnType, SchemaCache, TableDef, TableInfo};
pub use snapshot::{ReplicaSnapshot, RowSnapshot, TableSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::Replica;
pub use value::{PrimaryKey, Value};
pub use watermark::PeerWatermarkTracker;

use std::collections::BTreeMap;

pub type TableName = String;
pub type ColumnName = String;

/// Lamport database version; advances at least once per committed local
/// transaction and is raised by anything ingested.
pub type DbVersion = u64;
/// Per-column change counter.
pub type ColVersion = u64;
/// Intra-transaction ordering of captured changes.
pub type Seq = u64;
/// Incremented by any schema DDL to invalidate cached table info.
pub type SchemaGeneration = u64;
/// 1 while a row is alive, 2 once tombstoned.
pub type CausalLength = u64;

/// Non-key columns of one row.
pub type Row = BTreeMap<ColumnName, Value>;
