//! In-memory tabular results and bulk-copy payloads.

use crate::error::{DbError, DbResult};
use crate::models::{DbType, Value};
use serde_json::Value as JsonValue;

/// Column metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DataColumn {
    pub name: String,
    /// Declared type; used to type nulls in bulk copy.
    pub db_type: Option<DbType>,
}

impl DataColumn {
    pub fn new(name: impl Into<String>, db_type: Option<DbType>) -> Self {
        Self {
            name: name.into(),
            db_type,
        }
    }
}

/// A fully materialized result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    pub columns: Vec<DataColumn>,
    pub rows: Vec<Vec<Value>>,
}

impl DataTable {
    /// Create an empty table with the given columns.
    pub fn new(columns: Vec<DataColumn>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Create an empty table from column names.
    pub fn with_column_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(|n| DataColumn::new(n, None)).collect())
    }

    /// Append a row. The row must have one value per column.
    pub fn push_row(&mut self, row: Vec<Value>) -> DbResult<()> {
        if row.len() != self.columns.len() {
            return Err(DbError::invalid_argument(
                "row",
                format!(
                    "expected {} values, got {}",
                    self.columns.len(),
                    row.len()
                ),
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Resolve a column name: exact match first, then case-insensitive.
    pub fn ordinal(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
            })
    }

    /// First column of the first row, or null when empty.
    pub fn scalar(&self) -> Value {
        self.rows
            .first()
            .and_then(|r| r.first())
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json_rows(&self) -> Vec<serde_json::Map<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, value)| (col.name.clone(), value.to_json()))
                    .collect()
            })
            .collect()
    }
}

/// Every result set produced by one command, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSet {
    pub tables: Vec<DataTable>,
}

impl DataSet {
    pub fn new(tables: Vec<DataTable>) -> Self {
        Self { tables }
    }

    /// The first result set, if any.
    pub fn first(&self) -> Option<&DataTable> {
        self.tables.first()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(
            self.tables
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "columns": t.column_names(),
                        "rows": t.to_json_rows(),
                    })
                })
                .collect(),
        )
    }
}
