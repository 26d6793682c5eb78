//! Command parameters and their type tags.

use crate::models::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Vendor-neutral semantic type of a parameter or column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Boolean,
    Int16,
    Int32,
    Int64,
    Double,
    Decimal,
    String,
    Binary,
    DateTime,
    Guid,
    Json,
    /// Driver decides from the runtime value.
    Object,
}

/// Direction of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
}

impl ParameterDirection {
    /// True if the value is sent to the server.
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input | Self::InputOutput)
    }

    /// True if the server writes a value back.
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Output | Self::InputOutput)
    }
}

/// Oracle native type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OracleDbType {
    Varchar2,
    NVarchar2,
    Char,
    Number,
    Int16,
    Int32,
    Int64,
    BinaryDouble,
    Date,
    TimeStamp,
    Raw,
    Blob,
    Clob,
    RefCursor,
}

impl OracleDbType {
    /// Closest vendor-neutral type. `None` for cursors.
    pub fn db_type(&self) -> Option<DbType> {
        Some(match self {
            Self::Varchar2 | Self::NVarchar2 | Self::Char | Self::Clob => DbType::String,
            Self::Number => DbType::Decimal,
            Self::Int16 => DbType::Int16,
            Self::Int32 => DbType::Int32,
            Self::Int64 => DbType::Int64,
            Self::BinaryDouble => DbType::Double,
            Self::Date | Self::TimeStamp => DbType::DateTime,
            Self::Raw | Self::Blob => DbType::Binary,
            Self::RefCursor => return None,
        })
    }
}

/// PostgreSQL native type tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PgDbType {
    Boolean,
    Smallint,
    Integer,
    Bigint,
    Double,
    Numeric,
    Text,
    Varchar,
    Bytea,
    Timestamp,
    Uuid,
    Json,
    Jsonb,
    Array(Box<PgDbType>),
}

impl PgDbType {
    /// Array-of-`self` type tag.
    pub fn array_of(element: PgDbType) -> Self {
        Self::Array(Box::new(element))
    }

    /// Closest vendor-neutral type; arrays map to `Object`.
    pub fn db_type(&self) -> DbType {
        match self {
            Self::Boolean => DbType::Boolean,
            Self::Smallint => DbType::Int16,
            Self::Integer => DbType::Int32,
            Self::Bigint => DbType::Int64,
            Self::Double => DbType::Double,
            Self::Numeric => DbType::Decimal,
            Self::Text | Self::Varchar => DbType::String,
            Self::Bytea => DbType::Binary,
            Self::Timestamp => DbType::DateTime,
            Self::Uuid => DbType::Guid,
            Self::Json | Self::Jsonb => DbType::Json,
            Self::Array(_) => DbType::Object,
        }
    }

    /// SQL type name, used for casts on typed nulls.
    pub fn sql_name(&self) -> String {
        match self {
            Self::Boolean => "boolean".into(),
            Self::Smallint => "smallint".into(),
            Self::Integer => "integer".into(),
            Self::Bigint => "bigint".into(),
            Self::Double => "double precision".into(),
            Self::Numeric => "numeric".into(),
            Self::Text => "text".into(),
            Self::Varchar => "varchar".into(),
            Self::Bytea => "bytea".into(),
            Self::Timestamp => "timestamp".into(),
            Self::Uuid => "uuid".into(),
            Self::Json => "json".into(),
            Self::Jsonb => "jsonb".into(),
            Self::Array(inner) => format!("{}[]", inner.sql_name()),
        }
    }
}

/// Vendor-specific type tag carried by a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorType {
    Oracle(OracleDbType),
    Postgres(PgDbType),
}

/// Element types accepted by array parameters.
///
/// Implement this for additional element types to extend array support.
pub trait PgArrayElement: Into<Value> {
    fn pg_type() -> PgDbType;
}

macro_rules! impl_pg_array_element {
    ($($ty:ty => $pg:ident),+ $(,)?) => {
        $(
            impl PgArrayElement for $ty {
                fn pg_type() -> PgDbType {
                    PgDbType::$pg
                }
            }
        )+
    };
}

impl_pg_array_element! {
    bool => Boolean,
    i16 => Smallint,
    i32 => Integer,
    i64 => Bigint,
    f64 => Double,
    String => Text,
    &str => Text,
    Uuid => Uuid,
}

/// A command parameter.
///
/// `value` is `None` while unset; the facade replaces it with `Value::Null`
/// before binding input parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub direction: ParameterDirection,
    pub db_type: Option<DbType>,
    pub value: Option<Value>,
    pub size: Option<u32>,
    pub vendor_type: Option<VendorType>,
}

impl Parameter {
    /// Create an input parameter with no type or value. The name is used as given.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ParameterDirection::Input,
            db_type: None,
            value: None,
            size: None,
            vendor_type: None,
        }
    }

    /// Set the value, inferring the semantic type when none was declared.
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        let value = value.into();
        if self.db_type.is_none() {
            self.db_type = value.db_type();
        }
        self.value = Some(value);
        self
    }

    pub fn with_db_type(mut self, db_type: DbType) -> Self {
        self.db_type = Some(db_type);
        self
    }

    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_vendor_type(mut self, vendor_type: VendorType) -> Self {
        self.vendor_type = Some(vendor_type);
        self
    }

    /// Name without its vendor prefix character.
    pub fn bare_name(&self) -> &str {
        self.name.trim_start_matches([':', '@'])
    }

    /// Current value, treating unset as null.
    pub fn value_or_null(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.value.as_ref().unwrap_or(&NULL)
    }

    pub fn oracle_type(&self) -> Option<OracleDbType> {
        match &self.vendor_type {
            Some(VendorType::Oracle(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn pg_type(&self) -> Option<&PgDbType> {
        match &self.vendor_type {
            Some(VendorType::Postgres(t)) => Some(t),
            _ => None,
        }
    }
}
