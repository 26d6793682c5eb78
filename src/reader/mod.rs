//! Typed, null-coalescing access to forward-only result cursors.
//!
//! [`RowReader`] wraps any [`RowCursor`] and resolves columns by name. Column
//! ordinals come from, in order: an installed name map, a shared
//! [`OrdinalCache`] entry for the query shape, or the cursor itself.
//!
//! # Optimized mode
//!
//! With `.optimized(true)` the reader assumes every row exposes the same
//! columns in the same order. Lookups are numbered by call order within the
//! row; the first row resolves each name and remembers its ordinal at that
//! position, and later rows reuse the ordinal without looking at the name.
//! The counter is reset only by [`RowReader::read`].
//!
//! Lookups must therefore happen in the same sequence on every row. Asking for
//! different names (or in a different order) on a later row silently returns
//! whatever column was resolved at that position on the first row. Use
//! [`RowReader::skip_columns`] to keep positions aligned when a row reads
//! fewer columns.

mod cache;

pub use cache::{OrdinalCache, ShapeOrdinals};

use crate::error::{DbError, DbResult};
use crate::models::Value;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A forward-only cursor over one or more result sets.
pub trait RowCursor {
    /// Advance to the next row. Returns false once the result set is exhausted.
    fn read(&mut self) -> bool;

    /// Move to the next result set. Returns false if there is none.
    fn next_result(&mut self) -> bool;

    fn field_count(&self) -> usize;

    fn column_name(&self, ordinal: usize) -> Option<&str>;

    /// Resolve a column name to its ordinal in the current result set.
    fn ordinal(&self, name: &str) -> DbResult<usize>;

    /// Value at `ordinal` in the current row.
    fn value(&self, ordinal: usize) -> DbResult<&Value>;
}

impl<C: RowCursor + ?Sized> RowCursor for &mut C {
    fn read(&mut self) -> bool {
        (**self).read()
    }

    fn next_result(&mut self) -> bool {
        (**self).next_result()
    }

    fn field_count(&self) -> usize {
        (**self).field_count()
    }

    fn column_name(&self, ordinal: usize) -> Option<&str> {
        (**self).column_name(ordinal)
    }

    fn ordinal(&self, name: &str) -> DbResult<usize> {
        (**self).ordinal(name)
    }

    fn value(&self, ordinal: usize) -> DbResult<&Value> {
        (**self).value(ordinal)
    }
}

/// Typed getters and ordinal caching over a [`RowCursor`].
#[derive(Debug)]
pub struct RowReader<C> {
    cursor: C,
    optimized: bool,
    /// Call-order position of the next lookup in the current row.
    column_index: usize,
    /// Ordinal resolved at each call-order position (optimized mode).
    ordinals: Vec<Option<usize>>,
    shape: Option<Arc<ShapeOrdinals>>,
    name_map: Option<HashMap<String, usize>>,
}

impl<C: RowCursor> RowReader<C> {
    pub fn new(cursor: C) -> Self {
        Self {
            cursor,
            optimized: false,
            column_index: 0,
            ordinals: Vec::new(),
            shape: None,
            name_map: None,
        }
    }

    /// Enable or disable call-order ordinal caching. See the module docs.
    pub fn optimized(mut self, optimized: bool) -> Self {
        self.optimized = optimized;
        self
    }

    /// Share resolved ordinals with other readers of the same query shape.
    pub fn with_cache(mut self, key: &str, cache: &OrdinalCache) -> Self {
        self.shape = Some(cache.entry(key));
        self
    }

    /// Resolve names through `map` before consulting the cursor.
    pub fn with_name_map(mut self, map: HashMap<String, usize>) -> Self {
        self.name_map = Some(map);
        self
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    /// Advance to the next row and reset the call-order counter.
    pub fn read(&mut self) -> bool {
        self.column_index = 0;
        self.cursor.read()
    }

    /// Move to the next result set. Cached ordinals belong to the previous
    /// shape and are dropped, including the shared cache entry.
    pub fn next_result(&mut self) -> bool {
        self.column_index = 0;
        self.ordinals.clear();
        self.shape = None;
        self.cursor.next_result()
    }

    pub fn field_count(&self) -> usize {
        self.cursor.field_count()
    }

    /// Advance the call-order counter without a lookup.
    pub fn skip_columns(&mut self, count: usize) {
        self.column_index += count;
    }

    /// Release the wrapper and return the cursor.
    pub fn into_inner(self) -> C {
        self.cursor
    }

    pub fn cursor(&self) -> &C {
        &self.cursor
    }

    /// Resolve `name` to an ordinal according to the addressing mode.
    pub fn ordinal(&mut self, name: &str) -> DbResult<usize> {
        if !self.optimized {
            return self.resolve(name);
        }

        let position = self.column_index;
        self.column_index += 1;
        if let Some(Some(ordinal)) = self.ordinals.get(position) {
            return Ok(*ordinal);
        }
        let ordinal = self.resolve(name)?;
        if self.ordinals.len() <= position {
            self.ordinals.resize(position + 1, None);
        }
        self.ordinals[position] = Some(ordinal);
        Ok(ordinal)
    }

    fn resolve(&self, name: &str) -> DbResult<usize> {
        if let Some(map) = &self.name_map {
            let found = map.get(name).copied().or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| *v)
            });
            if let Some(ordinal) = found {
                return Ok(ordinal);
            }
        }
        if let Some(shape) = &self.shape {
            if let Some(ordinal) = shape.get(name) {
                return Ok(ordinal);
            }
            let ordinal = self.cursor.ordinal(name)?;
            return Ok(shape.insert(name, ordinal));
        }
        self.cursor.ordinal(name)
    }

    /// Raw value of the named column.
    pub fn get_value(&mut self, name: &str) -> DbResult<&Value> {
        let ordinal = self.ordinal(name)?;
        self.cursor.value(ordinal)
    }

    /// True if the named column holds null. Counts as a lookup in optimized mode.
    pub fn is_db_null(&mut self, name: &str) -> DbResult<bool> {
        Ok(self.get_value(name)?.is_null())
    }

    fn get_with<T>(
        &mut self,
        name: &str,
        default: T,
        expected: &'static str,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> DbResult<T> {
        let value = self.get_value(name)?;
        if value.is_null() {
            return Ok(default);
        }
        convert(value).ok_or_else(|| DbError::invalid_cast(name, expected, value.type_name()))
    }

    pub fn get_i64(&mut self, name: &str) -> DbResult<i64> {
        self.get_i64_or(name, 0)
    }

    pub fn get_i64_or(&mut self, name: &str, default: i64) -> DbResult<i64> {
        self.get_with(name, default, "i64", integer)
    }

    pub fn get_i32(&mut self, name: &str) -> DbResult<i32> {
        self.get_i32_or(name, 0)
    }

    pub fn get_i32_or(&mut self, name: &str, default: i32) -> DbResult<i32> {
        self.get_with(name, default, "i32", |v| {
            integer(v).and_then(|n| i32::try_from(n).ok())
        })
    }

    pub fn get_i16(&mut self, name: &str) -> DbResult<i16> {
        self.get_i16_or(name, 0)
    }

    pub fn get_i16_or(&mut self, name: &str, default: i16) -> DbResult<i16> {
        self.get_with(name, default, "i16", |v| {
            integer(v).and_then(|n| i16::try_from(n).ok())
        })
    }

    pub fn get_string(&mut self, name: &str) -> DbResult<String> {
        self.get_string_or(name, "")
    }

    pub fn get_string_or(&mut self, name: &str, default: &str) -> DbResult<String> {
        self.get_with(name, default.to_string(), "string", |v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Json(j) => Some(j.to_string()),
            _ => None,
        })
    }

    /// Booleans, or integers where nonzero is true.
    pub fn get_bool(&mut self, name: &str) -> DbResult<bool> {
        self.get_bool_or(name, false)
    }

    pub fn get_bool_or(&mut self, name: &str, default: bool) -> DbResult<bool> {
        self.get_with(name, default, "bool", |v| match v {
            Value::Bool(b) => Some(*b),
            Value::Decimal(d) => Some(!d.is_zero()),
            other => other.as_i64().map(|n| n != 0),
        })
    }

    pub fn get_decimal(&mut self, name: &str) -> DbResult<Decimal> {
        self.get_decimal_or(name, Decimal::ZERO)
    }

    pub fn get_decimal_or(&mut self, name: &str, default: Decimal) -> DbResult<Decimal> {
        self.get_with(name, default, "decimal", |v| match v {
            Value::Decimal(d) => Some(*d),
            Value::Double(f) => Decimal::try_from(*f).ok(),
            other => other.as_i64().map(Decimal::from),
        })
    }

    /// Null yields the Unix epoch.
    pub fn get_datetime(&mut self, name: &str) -> DbResult<NaiveDateTime> {
        self.get_datetime_or(name, NaiveDateTime::default())
    }

    pub fn get_datetime_or(&mut self, name: &str, default: NaiveDateTime) -> DbResult<NaiveDateTime> {
        self.get_with(name, default, "datetime", |v| match v {
            Value::DateTime(d) => Some(*d),
            _ => None,
        })
    }

    pub fn get_f64(&mut self, name: &str) -> DbResult<f64> {
        self.get_f64_or(name, 0.0)
    }

    pub fn get_f64_or(&mut self, name: &str, default: f64) -> DbResult<f64> {
        self.get_with(name, default, "f64", |v| match v {
            Value::Double(f) => Some(*f),
            Value::Decimal(d) => d.to_f64(),
            other => other.as_i64().map(|n| n as f64),
        })
    }

    pub fn get_guid(&mut self, name: &str) -> DbResult<Uuid> {
        self.get_guid_or(name, Uuid::nil())
    }

    pub fn get_guid_or(&mut self, name: &str, default: Uuid) -> DbResult<Uuid> {
        self.get_with(name, default, "guid", |v| match v {
            Value::Guid(g) => Some(*g),
            Value::String(s) => Uuid::parse_str(s).ok(),
            Value::Bytes(b) => Uuid::from_slice(b).ok(),
            _ => None,
        })
    }

    /// Binary payload, or `None` for null.
    pub fn get_bytes(&mut self, name: &str) -> DbResult<Option<Vec<u8>>> {
        let value = self.get_value(name)?;
        match value {
            Value::Null => Ok(None),
            Value::Bytes(b) => Ok(Some(b.clone())),
            other => Err(DbError::invalid_cast(name, "bytes", other.type_name())),
        }
    }

    pub fn get_bytes_or(&mut self, name: &str, default: Vec<u8>) -> DbResult<Vec<u8>> {
        Ok(self.get_bytes(name)?.unwrap_or(default))
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Decimal(d) if d.fract().is_zero() => d.to_i64(),
        other => other.as_i64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DataReader;
    use crate::models::DataTable;

    fn people() -> DataReader {
        let mut table = DataTable::with_column_names(["id", "name", "active", "score"]);
        table
            .push_row(vec![
                Value::Int32(1),
                "ada".into(),
                Value::Int16(1),
                Value::Decimal(Decimal::new(995, 1)),
            ])
            .unwrap();
        table
            .push_row(vec![Value::Int32(2), Value::Null, Value::Int16(0), Value::Null])
            .unwrap();
        DataReader::from_tables(vec![table])
    }

    #[test]
    fn test_typed_getters_and_null_defaults() {
        let mut reader = RowReader::new(people());
        assert!(reader.read());
        assert_eq!(reader.get_i64("id").unwrap(), 1);
        assert_eq!(reader.get_string("name").unwrap(), "ada");
        assert!(reader.get_bool("active").unwrap());
        assert_eq!(reader.get_decimal("score").unwrap(), Decimal::new(995, 1));
        assert_eq!(reader.get_f64("score").unwrap(), 99.5);

        assert!(reader.read());
        assert_eq!(reader.get_i32("id").unwrap(), 2);
        assert_eq!(reader.get_string("name").unwrap(), "");
        assert_eq!(reader.get_string_or("name", "n/a").unwrap(), "n/a");
        assert!(!reader.get_bool("active").unwrap());
        assert_eq!(reader.get_decimal_or("score", Decimal::ONE).unwrap(), Decimal::ONE);
        assert!(reader.is_db_null("score").unwrap());
        assert!(!reader.read());
    }

    #[test]
    fn test_invalid_cast_and_missing_column() {
        let mut reader = RowReader::new(people());
        reader.read();
        assert!(matches!(
            reader.get_i64("name"),
            Err(DbError::InvalidCast { expected: "i64", actual: "string", .. })
        ));
        assert!(matches!(
            reader.get_bytes("id"),
            Err(DbError::InvalidCast { .. })
        ));
        assert!(matches!(
            reader.get_i64("nope"),
            Err(DbError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_get_bytes_null_is_none() {
        let mut table = DataTable::with_column_names(["blob"]);
        table.push_row(vec![Value::Null]).unwrap();
        table.push_row(vec![Value::Bytes(vec![1, 2])]).unwrap();
        let mut reader = RowReader::new(DataReader::from_tables(vec![table]));
        reader.read();
        assert_eq!(reader.get_bytes("blob").unwrap(), None);
        assert_eq!(reader.get_bytes_or("blob", vec![9]).unwrap(), vec![9]);
        reader.read();
        assert_eq!(reader.get_bytes("blob").unwrap(), Some(vec![1, 2]));
    }

    #[test]
    fn test_optimized_same_order_reads_every_row() {
        let mut reader = RowReader::new(people()).optimized(true);
        let mut rows = Vec::new();
        while reader.read() {
            rows.push((reader.get_i64("id").unwrap(), reader.get_string("name").unwrap()));
        }
        assert_eq!(rows, vec![(1, "ada".to_string()), (2, String::new())]);
    }

    #[test]
    fn test_optimized_mismatched_order_must_not_be_relied_upon() {
        let mut reader = RowReader::new(people()).optimized(true);
        reader.read();
        assert_eq!(reader.get_i64("id").unwrap(), 1);
        reader.read();
        // Position 0 was resolved to "id" on the first row
        assert_eq!(reader.get_i32_or("active", -1).unwrap(), 2);
    }

    #[test]
    fn test_skip_columns_keeps_positions_aligned() {
        let mut reader = RowReader::new(people()).optimized(true);
        reader.read();
        reader.get_i64("id").unwrap();
        reader.get_string("name").unwrap();
        reader.read();
        reader.skip_columns(1);
        assert_eq!(reader.get_string_or("name", "none").unwrap(), "none");
    }

    #[test]
    fn test_shared_cache_across_readers() {
        let cache = OrdinalCache::new();
        let mut first = RowReader::new(people()).with_cache("people", &cache);
        first.read();
        first.get_string("name").unwrap();
        assert_eq!(cache.entry("people").get("name"), Some(1));

        let mut second = RowReader::new(people()).with_cache("people", &cache);
        second.read();
        assert_eq!(second.get_string("name").unwrap(), "ada");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_name_map_takes_precedence() {
        let map = HashMap::from([("label".to_string(), 1)]);
        let mut reader = RowReader::new(people()).with_name_map(map);
        reader.read();
        assert_eq!(reader.get_string("label").unwrap(), "ada");
        assert_eq!(reader.get_i64("id").unwrap(), 1);
    }

    #[test]
    fn test_wraps_borrowed_cursor() {
        let mut inner = people();
        {
            let mut reader = RowReader::new(&mut inner);
            reader.read();
            assert_eq!(reader.get_i16("id").unwrap(), 1);
        }
        assert!(inner.read());
        assert_eq!(inner.value(0).unwrap(), &Value::Int32(2));
    }

    #[test]
    fn test_guid_and_datetime_defaults() {
        let mut table = DataTable::with_column_names(["g", "d"]);
        table.push_row(vec![Value::Null, Value::Null]).unwrap();
        let mut reader = RowReader::new(DataReader::from_tables(vec![table]));
        reader.read();
        assert_eq!(reader.get_guid("g").unwrap(), Uuid::nil());
        assert_eq!(reader.get_datetime("d").unwrap(), NaiveDateTime::default());
    }
}
