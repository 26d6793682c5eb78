//! Forward-only cursor returned by the reader execute operations.

use crate::db::driver::Session;
use crate::error::{DbError, DbResult};
use crate::models::{DataTable, Value};
use crate::reader::RowCursor;
use tracing::{debug, warn};

/// Forward-only cursor over the result sets of one command.
///
/// When the facade opened the connection for the command, the reader owns the
/// driver session and closes it in [`DataReader::close`] (or drops it when the
/// reader is dropped). Readers over caller-owned connections hold no session.
pub struct DataReader {
    tables: Vec<DataTable>,
    table_index: usize,
    /// `None` before the first `read()`.
    row_index: Option<usize>,
    session: Option<Box<dyn Session>>,
}

impl DataReader {
    pub(crate) fn new(tables: Vec<DataTable>, session: Option<Box<dyn Session>>) -> Self {
        Self {
            tables,
            table_index: 0,
            row_index: None,
            session,
        }
    }

    /// A reader over in-memory tables, owning no connection.
    pub fn from_tables(tables: Vec<DataTable>) -> Self {
        Self::new(tables, None)
    }

    /// True if closing this reader closes the underlying connection.
    pub fn closes_connection(&self) -> bool {
        self.session.is_some()
    }

    /// True if the current result set has at least one row.
    pub fn has_rows(&self) -> bool {
        self.current_table().is_some_and(|t| !t.is_empty())
    }

    /// Columns of the current result set.
    pub fn column_names(&self) -> Vec<String> {
        self.current_table()
            .map(DataTable::column_names)
            .unwrap_or_default()
    }

    fn current_table(&self) -> Option<&DataTable> {
        self.tables.get(self.table_index)
    }

    fn current_row(&self) -> DbResult<&[Value]> {
        let table = self.current_table().ok_or(DbError::NoCurrentRow)?;
        self.row_index
            .and_then(|i| table.rows.get(i))
            .map(Vec::as_slice)
            .ok_or(DbError::NoCurrentRow)
    }

    /// Release the cursor, closing the connection if this reader owns it.
    pub async fn close(mut self) -> DbResult<()> {
        match self.session.take() {
            Some(session) => {
                debug!("Closing connection owned by reader");
                session.close().await
            }
            None => Ok(()),
        }
    }
}

impl RowCursor for DataReader {
    fn read(&mut self) -> bool {
        let Some(len) = self.current_table().map(DataTable::len) else {
            return false;
        };
        let next = self.row_index.map_or(0, |i| i + 1);
        self.row_index = Some(next.min(len));
        next < len
    }

    fn next_result(&mut self) -> bool {
        if self.table_index < self.tables.len() {
            self.table_index += 1;
        }
        self.row_index = None;
        self.table_index < self.tables.len()
    }

    fn field_count(&self) -> usize {
        self.current_table().map_or(0, |t| t.columns.len())
    }

    fn column_name(&self, ordinal: usize) -> Option<&str> {
        self.current_table()
            .and_then(|t| t.columns.get(ordinal))
            .map(|c| c.name.as_str())
    }

    fn ordinal(&self, name: &str) -> DbResult<usize> {
        self.current_table()
            .and_then(|t| t.ordinal(name))
            .ok_or_else(|| DbError::column_not_found(name))
    }

    fn value(&self, ordinal: usize) -> DbResult<&Value> {
        let row = self.current_row()?;
        row.get(ordinal).ok_or_else(|| {
            DbError::column_not_found(format!("#{ordinal} (row has {} columns)", row.len()))
        })
    }
}

impl Drop for DataReader {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("DataReader dropped without close(); connection closed without a graceful shutdown");
        }
    }
}

impl std::fmt::Debug for DataReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReader")
            .field("result_sets", &self.tables.len())
            .field("table_index", &self.table_index)
            .field("row_index", &self.row_index)
            .field("closes_connection", &self.closes_connection())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> DataReader {
        let mut first = DataTable::with_column_names(["id"]);
        first.push_row(vec![Value::Int32(1)]).unwrap();
        first.push_row(vec![Value::Int32(2)]).unwrap();
        let mut second = DataTable::with_column_names(["name"]);
        second.push_row(vec!["x".into()]).unwrap();
        DataReader::from_tables(vec![first, second])
    }

    #[test]
    fn test_forward_only_iteration() {
        let mut r = reader();
        assert!(matches!(r.value(0), Err(DbError::NoCurrentRow)));
        assert!(r.read());
        assert_eq!(r.value(0).unwrap(), &Value::Int32(1));
        assert!(r.read());
        assert_eq!(r.value(0).unwrap(), &Value::Int32(2));
        assert!(!r.read());
        assert!(!r.read());
        assert!(matches!(r.value(0), Err(DbError::NoCurrentRow)));
    }

    #[test]
    fn test_next_result() {
        let mut r = reader();
        assert!(r.next_result());
        assert_eq!(r.column_names(), vec!["name".to_string()]);
        assert!(r.read());
        assert_eq!(r.value(r.ordinal("NAME").unwrap()).unwrap(), &Value::from("x"));
        assert!(!r.next_result());
        assert!(!r.read());
        assert_eq!(r.field_count(), 0);
    }

    #[test]
    fn test_in_memory_reader_owns_no_connection() {
        assert!(!reader().closes_connection());
    }
}
