//! The generic value container used for parameters and result cells.
//!
//! `Value::Null` is the database null sentinel. Native `None` never reaches a
//! driver: every conversion from `Option<T>` maps `None` to `Value::Null`.

use crate::models::DbType;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A database value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    Guid(Uuid),
    Json(JsonValue),
    /// Homogeneous array; element type travels on the parameter's vendor type.
    Array(Vec<Value>),
}

impl Value {
    /// Check if this value is the null sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Double(_) => "double",
            Self::Decimal(_) => "decimal",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::DateTime(_) => "datetime",
            Self::Guid(_) => "guid",
            Self::Json(_) => "json",
            Self::Array(_) => "array",
        }
    }

    /// Semantic type inferred from the runtime value. `None` for null.
    pub fn db_type(&self) -> Option<DbType> {
        Some(match self {
            Self::Null => return None,
            Self::Bool(_) => DbType::Boolean,
            Self::Int16(_) => DbType::Int16,
            Self::Int32(_) => DbType::Int32,
            Self::Int64(_) => DbType::Int64,
            Self::Double(_) => DbType::Double,
            Self::Decimal(_) => DbType::Decimal,
            Self::String(_) => DbType::String,
            Self::Bytes(_) => DbType::Binary,
            Self::DateTime(_) => DbType::DateTime,
            Self::Guid(_) => DbType::Guid,
            Self::Json(_) => DbType::Json,
            Self::Array(_) => DbType::Object,
        })
    }

    /// Widen any integer variant to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(v) => Some(*v as i64),
            Self::Int32(v) => Some(*v as i64),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to JSON for display and serialization.
    ///
    /// Binary data is base64 encoded, decimals keep their exact text form.
    pub fn to_json(&self) -> JsonValue {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int16(v) => JsonValue::Number((*v).into()),
            Self::Int32(v) => JsonValue::Number((*v).into()),
            Self::Int64(v) => JsonValue::Number((*v).into()),
            Self::Double(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            Self::Decimal(v) => JsonValue::String(v.to_string()),
            Self::String(v) => JsonValue::String(v.clone()),
            Self::Bytes(v) => JsonValue::String(STANDARD.encode(v)),
            Self::DateTime(v) => JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Self::Guid(v) => JsonValue::String(v.to_string()),
            Self::Json(v) => v.clone(),
            Self::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    /// Parse a loosely typed CLI literal: `null`, booleans, integers, floats, else text.
    pub fn parse_literal(s: &str) -> Self {
        if s.eq_ignore_ascii_case("null") {
            return Self::Null;
        }
        if s.eq_ignore_ascii_case("true") {
            return Self::Bool(true);
        }
        if s.eq_ignore_ascii_case("false") {
            return Self::Bool(false);
        }
        if let Ok(v) = s.parse::<i32>() {
            return Self::Int32(v);
        }
        if let Ok(v) = s.parse::<i64>() {
            return Self::Int64(v);
        }
        if let Ok(v) = s.parse::<f64>() {
            return Self::Double(v);
        }
        Self::String(s.to_string())
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )+
    };
}

impl_from_value! {
    bool => Bool,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f64 => Double,
    Decimal => Decimal,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
    &[u8] => Bytes,
    NaiveDateTime => DateTime,
    Uuid => Guid,
    JsonValue => Json,
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Double(v as f64)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_maps_to_null() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(None::<String>), Value::Null);
        assert_eq!(Value::from(Some(5i64)), Value::Int64(5));
    }

    #[test]
    fn test_inferred_db_type() {
        assert_eq!(Value::from(42i32).db_type(), Some(DbType::Int32));
        assert_eq!(Value::from("x").db_type(), Some(DbType::String));
        assert_eq!(Value::Null.db_type(), None);
    }

    #[test]
    fn test_to_json() {
        assert_eq!(Value::Bytes(b"hello world".to_vec()).to_json(), "aGVsbG8gd29ybGQ=");
        assert_eq!(
            Value::Decimal(Decimal::new(12345, 2)).to_json(),
            JsonValue::String("123.45".into())
        );
        assert_eq!(Value::Double(f64::NAN).to_json(), JsonValue::String("NaN".into()));
        assert_eq!(
            Value::Array(vec![Value::Int32(1), Value::Null]).to_json(),
            serde_json::json!([1, null])
        );
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(Value::parse_literal("42"), Value::Int32(42));
        assert_eq!(Value::parse_literal("9000000000"), Value::Int64(9_000_000_000));
        assert_eq!(Value::parse_literal("1.5"), Value::Double(1.5));
        assert_eq!(Value::parse_literal("NULL"), Value::Null);
        assert_eq!(Value::parse_literal("True"), Value::Bool(true));
        assert_eq!(Value::parse_literal("abc"), Value::String("abc".into()));
    }
}
