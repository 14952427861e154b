//! Change records: the wire unit streamed and ingested by the change feed.

use crate::{
    CausalLength, ColVersion, ColumnName, DbVersion, PrimaryKey, Seq, SiteId, TableName, Value,
};
use serde::{Deserialize, Serialize};

/// Causal length carried by records of live rows.
pub const CAUSAL_LENGTH_ALIVE: CausalLength = 1;
/// Causal length carried by delete-sentinel records.
pub const CAUSAL_LENGTH_DELETED: CausalLength = 2;

/// Identifies what a clock entry or change record is about: a real column,
/// the row tombstone, or bare row existence (used for rows whose primary key
/// is the entirety of the row, and as the row-creation marker).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnId {
    /// Row tombstone.
    Delete,
    /// Row existence / creation marker.
    Existence,
    Column(ColumnName),
}

impl ColumnId {
    pub fn column(name: impl Into<ColumnName>) -> Self {
        ColumnId::Column(name.into())
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, ColumnId::Column(_))
    }
}

impl std::fmt::Display for ColumnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnId::Delete => write!(f, "__delete__"),
            ColumnId::Existence => write!(f, "__exists__"),
            ColumnId::Column(name) => write!(f, "{name}"),
        }
    }
}

/// One replicated change: the value and clock state of a single
/// (row, column) pair at a point in time.
///
/// Records are produced ordered by `(db_version, seq)` and can be ingested in
/// any order with the same outcome; `causal_length` distinguishes a genuine
/// value from a tombstone marker for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub table: TableName,
    pub pk: PrimaryKey,
    pub column_id: ColumnId,
    pub value: Value,
    pub col_version: ColVersion,
    pub db_version: DbVersion,
    pub site_id: SiteId,
    pub seq: Seq,
    pub causal_length: CausalLength,
}

impl ChangeRecord {
    pub fn is_tombstone(&self) -> bool {
        self.column_id == ColumnId::Delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ChangeRecord {
        ChangeRecord {
            table: "todos".to_string(),
            pk: PrimaryKey::new(vec![Value::Integer(1)]),
            column_id: ColumnId::column("title"),
            value: Value::text("buy milk"),
            col_version: 1,
            db_version: 3,
            site_id: SiteId::from_bytes([7; 16]),
            seq: 0,
            causal_length: CAUSAL_LENGTH_ALIVE,
        }
    }

    #[test]
    fn sentinels() {
        assert!(ColumnId::Delete.is_sentinel());
        assert!(ColumnId::Existence.is_sentinel());
        assert!(!ColumnId::column("title").is_sentinel());
    }

    #[test]
    fn sentinel_display() {
        assert_eq!(ColumnId::Delete.to_string(), "__delete__");
        assert_eq!(ColumnId::Existence.to_string(), "__exists__");
        assert_eq!(ColumnId::column("title").to_string(), "title");
    }

    #[test]
    fn sentinels_sort_before_columns() {
        let mut ids = vec![
            ColumnId::column("a"),
            ColumnId::Existence,
            ColumnId::Delete,
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![ColumnId::Delete, ColumnId::Existence, ColumnId::column("a")]
        );
    }

    #[test]
    fn tombstone_detection() {
        let mut rec = record();
        assert!(!rec.is_tombstone());
        rec.column_id = ColumnId::Delete;
        rec.causal_length = CAUSAL_LENGTH_DELETED;
        assert!(rec.is_tombstone());
    }

    #[test]
    fn serialization_roundtrip() {
        let rec = record();
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("colVersion"));
        let parsed: ChangeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, parsed);
    }
}
