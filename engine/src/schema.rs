//! Table definitions, CRR eligibility checks, and the schema cache.
//!
//! `TableDef` is the catalog entry supplied by the caller (the modeled
//! relational engine). `TableInfo` is the immutable introspected snapshot the
//! rest of the engine works against. The cache is keyed by a schema
//! generation counter: any DDL bumps the generation and forces exactly one
//! re-introspection on next access.

use crate::{error::Result, ColumnName, Error, SchemaGeneration, TableName, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Declared column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
}

impl ColumnType {
    /// Whether a replicated value can be stored in a column of this type.
    /// Null is always admitted; nullability is a write-side constraint, and
    /// integers are admitted where a real is declared.
    pub fn admits(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ColumnType::Integer, Value::Integer(_))
                | (ColumnType::Real, Value::Real(_) | Value::Integer(_))
                | (ColumnType::Text, Value::Text(_))
                | (ColumnType::Blob, Value::Blob(_))
        )
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "Integer"),
            ColumnType::Real => write!(f, "Real"),
            ColumnType::Text => write!(f, "Text"),
            ColumnType::Blob => write!(f, "Blob"),
        }
    }
}

/// Definition of one column in a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: ColumnName,
    pub column_type: ColumnType,
    pub not_null: bool,
    /// Deterministic default used when a write or a partial remote change
    /// set omits the column.
    pub default: Option<Value>,
    /// Position within the primary key, if part of it.
    pub pk_ordinal: Option<u32>,
    pub autoincrement: bool,
}

impl ColumnDef {
    /// A primary-key column at the next ordinal the caller assigns.
    pub fn primary_key(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            not_null: true,
            default: None,
            pk_ordinal: Some(0),
            autoincrement: false,
        }
    }

    /// A nullable non-key column.
    pub fn nullable(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            not_null: false,
            default: None,
            pk_ordinal: None,
            autoincrement: false,
        }
    }

    /// A NOT NULL non-key column with a default.
    pub fn not_null_with_default(
        name: impl Into<ColumnName>,
        column_type: ColumnType,
        default: Value,
    ) -> Self {
        Self {
            name: name.into(),
            column_type,
            not_null: true,
            default: Some(default),
            pk_ordinal: None,
            autoincrement: false,
        }
    }

    /// Builder-style ordinal override for composite keys.
    pub fn at_pk_ordinal(mut self, ordinal: u32) -> Self {
        self.pk_ordinal = Some(ordinal);
        self
    }

    /// The value a row holds for this column when none was written.
    pub fn default_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }
}

/// Catalog entry for a base table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
    pub name: TableName,
    pub columns: Vec<ColumnDef>,
    /// Unique indices beyond the primary key.
    pub unique_indexes: Vec<Vec<ColumnName>>,
    pub enforced_foreign_keys: bool,
}

impl TableDef {
    pub fn new(name: impl Into<TableName>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique_indexes: Vec::new(),
            enforced_foreign_keys: false,
        }
    }

    pub fn with_unique_index(mut self, columns: Vec<ColumnName>) -> Self {
        self.unique_indexes.push(columns);
        self
    }

    pub fn with_enforced_foreign_keys(mut self) -> Self {
        self.enforced_foreign_keys = true;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary-key column names in ordinal order.
    pub fn pk_columns(&self) -> Vec<ColumnName> {
        let mut pk: Vec<&ColumnDef> = self.columns.iter().filter(|c| c.pk_ordinal.is_some()).collect();
        pk.sort_by_key(|c| c.pk_ordinal);
        pk.into_iter().map(|c| c.name.clone()).collect()
    }
}

/// Immutable introspected snapshot of a table's shape.
///
/// Rebuilt whenever the schema generation changes; owned by the cache and
/// handed out as `Arc`, never retained by callers past a single operation.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub name: TableName,
    pub columns: Vec<ColumnDef>,
    pub pk_columns: Vec<ColumnName>,
    pub non_pk_columns: Vec<ColumnName>,
}

impl TableInfo {
    /// Introspect a table definition and check CRR eligibility.
    ///
    /// Every rule here exists because the merge engine must be able to
    /// materialize a row from a partial set of remote changes: any column
    /// that is not part of the change set must have a deterministic default,
    /// and no secondary constraint may reject the materialized row.
    pub fn introspect(def: &TableDef) -> Result<TableInfo> {
        let pk_columns = def.pk_columns();
        if pk_columns.is_empty() {
            return Err(Error::incompatible(&def.name, "missing primary key"));
        }
        if def
            .columns
            .iter()
            .any(|c| c.pk_ordinal.is_some() && c.autoincrement)
        {
            return Err(Error::incompatible(
                &def.name,
                "auto-incrementing primary key",
            ));
        }
        if !def.unique_indexes.is_empty() {
            return Err(Error::incompatible(
                &def.name,
                "unique indices beyond the primary key",
            ));
        }
        if def.enforced_foreign_keys {
            return Err(Error::incompatible(&def.name, "enforced foreign keys"));
        }
        for col in &def.columns {
            if col.pk_ordinal.is_none() && col.not_null && col.default.is_none() {
                return Err(Error::incompatible(
                    &def.name,
                    format!("NOT NULL column '{}' has no default", col.name),
                ));
            }
        }

        let non_pk_columns = def
            .columns
            .iter()
            .filter(|c| c.pk_ordinal.is_none())
            .map(|c| c.name.clone())
            .collect();

        Ok(TableInfo {
            name: def.name.clone(),
            columns: def.columns.clone(),
            pk_columns,
            non_pk_columns,
        })
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_non_pk_column(&self, name: &str) -> bool {
        self.non_pk_columns.iter().any(|c| c == name)
    }
}

#[derive(Debug, Clone)]
struct CachedInfo {
    generation: SchemaGeneration,
    info: Arc<TableInfo>,
}

/// Arena of `TableInfo` keyed by table name plus a generation counter.
///
/// DDL bumps the generation; the next access re-introspects once. Entries are
/// never mutated in place.
#[derive(Debug, Default)]
pub struct SchemaCache {
    generation: SchemaGeneration,
    entries: BTreeMap<TableName, CachedInfo>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> SchemaGeneration {
        self.generation
    }

    /// Invalidate all cached info. Called on any schema DDL.
    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    /// Introspected info for a table, re-validated after any DDL.
    pub fn table_info(&mut self, def: &TableDef) -> Result<Arc<TableInfo>> {
        if let Some(cached) = self.entries.get(&def.name) {
            if cached.generation == self.generation {
                return Ok(Arc::clone(&cached.info));
            }
        }
        let info = Arc::new(TableInfo::introspect(def)?);
        self.entries.insert(
            def.name.clone(),
            CachedInfo {
                generation: self.generation,
                info: Arc::clone(&info),
            },
        );
        Ok(info)
    }
}
