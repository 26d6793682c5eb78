//! Oracle driver on the `oracle` crate (ODPI-C).
//!
//! The client library is synchronous, so every call runs on tokio's blocking
//! pool against a shared connection handle. Autocommit stays off: outside an
//! explicit transaction each command is committed after it succeeds.
//!
//! Command timeouts are enforced by ODPI-C call timeouts when the client
//! library supports them. Otherwise the facade stops waiting at the deadline;
//! the abandoned call then rolls back instead of committing.
//!
//! Stored procedures are called as anonymous PL/SQL blocks with named
//! notation. Ref cursor outputs are fetched after the call and appended to the
//! command's result sets in parameter order.

use crate::db::Vendor;
use crate::db::driver::{DriverFactory, IsolationLevel, PreparedCommand, Session};
use crate::error::{DbError, DbResult};
use crate::models::{
    CommandType, DataColumn, DataTable, DbType, OracleDbType, Parameter, ParameterDirection, Value,
};
use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDateTime};
use oracle::sql_type::{OracleType, RefCursor, ToSql};
use oracle::{Connection, ResultSet, Row, SqlValue, Statement};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_VARCHAR_SIZE: u32 = 4000;
const DEFAULT_RAW_SIZE: u32 = 2000;

/// Factory for Oracle sessions.
///
/// Connection strings use the ADO.NET keys `User Id`, `Password` and
/// `Data Source`; the data source is any connect string ODPI-C accepts.
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleDriver;

#[derive(Debug, PartialEq, Eq)]
struct ConnectParams {
    user: String,
    password: String,
    data_source: String,
}

fn parse_connection_string(connection_string: &str) -> DbResult<ConnectParams> {
    let mut user = None;
    let mut password = None;
    let mut data_source = None;

    for part in connection_string.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "user id" | "userid" | "uid" | "user" => user = Some(value),
            "password" | "pwd" => password = Some(value),
            "data source" | "datasource" | "server" => data_source = Some(value),
            _ => {}
        }
    }

    let missing = |key: &str| {
        DbError::invalid_argument(
            "connection_string",
            format!("Oracle connection string is missing '{key}'"),
        )
    };
    Ok(ConnectParams {
        user: user.ok_or_else(|| missing("User Id"))?,
        password: password.ok_or_else(|| missing("Password"))?,
        data_source: data_source.ok_or_else(|| missing("Data Source"))?,
    })
}

async fn blocking<T, F>(f: F) -> DbResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> DbResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(DbError::driver)?
}

#[async_trait]
impl DriverFactory for OracleDriver {
    fn vendor(&self) -> Vendor {
        Vendor::Oracle
    }

    async fn connect(&self, connection_string: &str) -> DbResult<Box<dyn Session>> {
        let params = parse_connection_string(connection_string)?;
        let (conn, call_timeouts) = blocking(move || {
            let conn = Connection::connect(&params.user, &params.password, &params.data_source)?;
            // Call timeouts need Oracle Client 18 or later
            let call_timeouts = conn.call_timeout().is_ok();
            Ok((conn, call_timeouts))
        })
        .await?;
        debug!(call_timeouts, "Oracle session opened");
        Ok(Box::new(OracleSession {
            conn: Arc::new(conn),
            in_transaction: false,
            call_timeouts,
        }))
    }
}

pub struct OracleSession {
    conn: Arc<Connection>,
    in_transaction: bool,
    call_timeouts: bool,
}

/// Flags the blocking call as abandoned if the awaiting future is dropped
/// before it completes.
struct AbandonOnDrop {
    abandoned: Arc<AtomicBool>,
    armed: bool,
}

impl AbandonOnDrop {
    fn new() -> Self {
        Self {
            abandoned: Arc::new(AtomicBool::new(false)),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }
}

/// ODPI-C reports an expired call timeout as DPI-1067; the server may answer
/// with ORA-03156 first.
fn is_call_timeout(message: &str) -> bool {
    message.contains("DPI-1067") || message.contains("ORA-03156")
}

/// What one blocking call hands back to the async side.
struct Outcome {
    rows_affected: u64,
    tables: Vec<DataTable>,
    parameters: Vec<Parameter>,
}

impl OracleSession {
    async fn run(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<Outcome> {
        let conn = Arc::clone(&self.conn);
        let sql = match command.command_type {
            CommandType::Text => command.text.to_string(),
            CommandType::StoredProcedure => build_call(command.text.trim(), command.parameters),
        };
        let parameters = command.parameters.to_vec();
        let by_name = command.bind_by_name;
        let timeout = command.timeout;
        let commit = !self.in_transaction;
        let mut guard = AbandonOnDrop::new();
        let abandoned = Arc::clone(&guard.abandoned);

        let outcome = blocking(move || {
            execute_blocking(&conn, &sql, parameters, by_name, timeout, commit, &abandoned)
        })
        .await;
        guard.disarm();
        let outcome = outcome.map_err(|e| {
            if is_call_timeout(&e.to_string()) {
                DbError::timeout("command execution", timeout.as_secs() as u32)
            } else {
                e
            }
        })?;

        for (target, source) in command.parameters.iter_mut().zip(&outcome.parameters) {
            if target.direction.is_output() {
                target.value = source.value.clone();
            }
        }
        Ok(outcome)
    }

    async fn on_connection<F>(&self, f: F) -> DbResult<()>
    where
        F: FnOnce(&Connection) -> oracle::Result<()> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        blocking(move || Ok(f(&conn)?)).await
    }
}

#[async_trait]
impl Session for OracleSession {
    async fn execute(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<u64> {
        Ok(self.run(command).await?.rows_affected)
    }

    async fn query(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<Vec<DataTable>> {
        Ok(self.run(command).await?.tables)
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> DbResult<()> {
        // Oracle offers read committed and serializable only
        let level = match isolation {
            IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead
            | IsolationLevel::Serializable
            | IsolationLevel::Snapshot => "SERIALIZABLE",
        };
        let sql = format!("SET TRANSACTION ISOLATION LEVEL {level}");
        self.on_connection(move |conn| conn.execute(&sql, &[]).map(|_| ()))
            .await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.on_connection(|conn| conn.commit()).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.on_connection(|conn| conn.rollback()).await?;
        self.in_transaction = false;
        Ok(())
    }

    fn enforces_timeout(&self) -> bool {
        self.call_timeouts
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.on_connection(|conn| conn.close()).await
    }
}

// =============================================================================
// Statement execution (blocking)
// =============================================================================

/// `BEGIN name(a => :a, ...); END;`
fn build_call(name: &str, parameters: &[Parameter]) -> String {
    let args = parameters
        .iter()
        .map(|p| format!("{0} => :{0}", p.bare_name()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("BEGIN {name}({args}); END;")
}

fn execute_blocking(
    conn: &Connection,
    sql: &str,
    mut parameters: Vec<Parameter>,
    by_name: bool,
    timeout: Duration,
    commit: bool,
    abandoned: &AtomicBool,
) -> DbResult<Outcome> {
    if let Err(e) = conn.set_call_timeout(Some(timeout)) {
        debug!(error = %e, "Oracle call timeout not applied");
    }

    let mut stmt = conn.statement(sql).build()?;
    for (position, parameter) in parameters.iter().enumerate() {
        bind_parameter(&mut stmt, parameter, position + 1, by_name)?;
    }

    let mut tables = Vec::new();
    let rows_affected = if stmt.is_query() {
        let table = read_result_set(stmt.query(&[])?)?;
        let count = table.len() as u64;
        tables.push(table);
        count
    } else {
        stmt.execute(&[])?;
        stmt.row_count()?
    };

    for (position, parameter) in parameters.iter_mut().enumerate() {
        if !parameter.direction.is_output() {
            continue;
        }
        let index = BindAt::new(parameter, position + 1, by_name);
        if parameter.oracle_type() == Some(OracleDbType::RefCursor) {
            let cursor: Option<RefCursor> = index.value(&stmt)?;
            if let Some(mut cursor) = cursor {
                tables.push(read_result_set(cursor.query()?)?);
            }
        } else {
            parameter.value = Some(read_output(&stmt, &index, parameter)?);
        }
    }

    if abandoned.load(Ordering::SeqCst) {
        warn!("Rolling back Oracle command abandoned after timeout");
        conn.rollback()?;
        return Err(DbError::timeout("command execution", timeout.as_secs() as u32));
    }
    if commit {
        conn.commit()?;
    }
    Ok(Outcome {
        rows_affected,
        tables,
        parameters,
    })
}

/// Bind target: by bare name or by 1-based position.
enum BindAt {
    Name(String),
    Position(usize),
}

impl BindAt {
    fn new(parameter: &Parameter, position: usize, by_name: bool) -> Self {
        if by_name {
            Self::Name(parameter.bare_name().to_string())
        } else {
            Self::Position(position)
        }
    }

    fn bind(&self, stmt: &mut Statement, value: &dyn ToSql) -> oracle::Result<()> {
        match self {
            Self::Name(name) => stmt.bind(name.as_str(), value),
            Self::Position(pos) => stmt.bind(*pos, value),
        }
    }

    fn value<T: oracle::sql_type::FromSql>(&self, stmt: &Statement) -> oracle::Result<T> {
        match self {
            Self::Name(name) => stmt.bind_value(name.as_str()),
            Self::Position(pos) => stmt.bind_value(*pos),
        }
    }
}

/// Oracle type used for nulls and output buffers.
fn oracle_type(parameter: &Parameter) -> OracleType {
    let varchar = parameter.size.unwrap_or(DEFAULT_VARCHAR_SIZE);
    let raw = parameter.size.unwrap_or(DEFAULT_RAW_SIZE);
    if let Some(tag) = parameter.oracle_type() {
        return match tag {
            OracleDbType::Varchar2 => OracleType::Varchar2(varchar),
            OracleDbType::NVarchar2 => OracleType::NVarchar2(varchar),
            OracleDbType::Char => OracleType::Char(parameter.size.unwrap_or(1)),
            OracleDbType::Number => OracleType::Number(0, 0),
            OracleDbType::Int16 | OracleDbType::Int32 | OracleDbType::Int64 => OracleType::Int64,
            OracleDbType::BinaryDouble => OracleType::BinaryDouble,
            OracleDbType::Date => OracleType::Date,
            OracleDbType::TimeStamp => OracleType::Timestamp(9),
            OracleDbType::Raw => OracleType::Raw(raw),
            OracleDbType::Blob => OracleType::BLOB,
            OracleDbType::Clob => OracleType::CLOB,
            OracleDbType::RefCursor => OracleType::RefCursor,
        };
    }
    match parameter.db_type.or_else(|| parameter.value_or_null().db_type()) {
        Some(DbType::Boolean | DbType::Int16 | DbType::Int32 | DbType::Int64) => OracleType::Int64,
        Some(DbType::Double) => OracleType::BinaryDouble,
        Some(DbType::Decimal) => OracleType::Number(0, 0),
        Some(DbType::Binary) => OracleType::Raw(raw),
        Some(DbType::DateTime) => OracleType::Timestamp(9),
        Some(DbType::Guid) => OracleType::Raw(16),
        Some(DbType::String | DbType::Json | DbType::Object) | None => OracleType::Varchar2(varchar),
    }
}

/// Input value converted to a type the client library binds.
enum OraValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
}

impl OraValue {
    fn from_value(parameter: &Parameter) -> DbResult<Self> {
        Ok(match parameter.value_or_null() {
            Value::Null => Self::Null,
            Value::Bool(v) => Self::Int(i64::from(*v)),
            Value::Int16(v) => Self::Int(i64::from(*v)),
            Value::Int32(v) => Self::Int(i64::from(*v)),
            Value::Int64(v) => Self::Int(*v),
            Value::Double(v) => Self::Float(*v),
            Value::Decimal(v) => Self::Text(v.to_string()),
            Value::String(v) => Self::Text(v.clone()),
            Value::Bytes(v) => Self::Bytes(v.clone()),
            Value::DateTime(v) => Self::Timestamp(*v),
            Value::Guid(v) => Self::Bytes(v.as_bytes().to_vec()),
            Value::Json(v) => Self::Text(v.to_string()),
            Value::Array(_) => return Err(DbError::not_supported("Array parameters", Vendor::Oracle)),
        })
    }
}

fn bind_parameter(
    stmt: &mut Statement,
    parameter: &Parameter,
    position: usize,
    by_name: bool,
) -> DbResult<()> {
    let at = BindAt::new(parameter, position, by_name);
    let ty = oracle_type(parameter);

    if parameter.direction == ParameterDirection::Output {
        at.bind(stmt, &ty)?;
        return Ok(());
    }

    // In-out values are bound with the declared type so the buffer fits the output
    let in_out = parameter.direction == ParameterDirection::InputOutput;
    match OraValue::from_value(parameter)? {
        OraValue::Null => at.bind(stmt, &ty)?,
        OraValue::Int(v) if in_out => at.bind(stmt, &(&v, &ty))?,
        OraValue::Int(v) => at.bind(stmt, &v)?,
        OraValue::Float(v) if in_out => at.bind(stmt, &(&v, &ty))?,
        OraValue::Float(v) => at.bind(stmt, &v)?,
        OraValue::Text(v) if in_out => at.bind(stmt, &(&v, &ty))?,
        OraValue::Text(v) => at.bind(stmt, &v)?,
        OraValue::Bytes(v) if in_out => at.bind(stmt, &(&v, &ty))?,
        OraValue::Bytes(v) => at.bind(stmt, &v)?,
        OraValue::Timestamp(v) if in_out => at.bind(stmt, &(&v, &ty))?,
        OraValue::Timestamp(v) => at.bind(stmt, &v)?,
    }
    Ok(())
}

fn read_output(stmt: &Statement, at: &BindAt, parameter: &Parameter) -> DbResult<Value> {
    let db_type = parameter
        .db_type
        .or_else(|| parameter.oracle_type().and_then(|t| t.db_type()));

    Ok(match oracle_type(parameter) {
        OracleType::Int64 => match at.value::<Option<i64>>(stmt)? {
            None => Value::Null,
            Some(v) => match db_type {
                Some(DbType::Boolean) => Value::Bool(v != 0),
                Some(DbType::Int16) => i16::try_from(v).map(Value::Int16).unwrap_or(Value::Int64(v)),
                Some(DbType::Int32) => i32::try_from(v).map(Value::Int32).unwrap_or(Value::Int64(v)),
                _ => Value::Int64(v),
            },
        },
        OracleType::BinaryDouble => at.value::<Option<f64>>(stmt)?.into(),
        OracleType::Number(_, _) => match at.value::<Option<String>>(stmt)? {
            Some(text) => parse_number(&text),
            None => Value::Null,
        },
        OracleType::Date | OracleType::Timestamp(_) => at.value::<Option<NaiveDateTime>>(stmt)?.into(),
        OracleType::Raw(_) | OracleType::BLOB => {
            let bytes = at.value::<Option<Vec<u8>>>(stmt)?;
            match (bytes, db_type) {
                (Some(b), Some(DbType::Guid)) => Uuid::from_slice(&b)
                    .map(Value::Guid)
                    .unwrap_or(Value::Bytes(b)),
                (bytes, _) => bytes.into(),
            }
        }
        _ => {
            let text = at.value::<Option<String>>(stmt)?;
            match (text, db_type) {
                (Some(t), Some(DbType::Json)) => serde_json::from_str(&t)
                    .map(Value::Json)
                    .unwrap_or(Value::String(t)),
                (text, _) => text.into(),
            }
        }
    })
}

fn parse_number(text: &str) -> Value {
    if let Ok(v) = text.parse::<i64>() {
        return Value::Int64(v);
    }
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map(Value::Decimal)
        .unwrap_or_else(|_| Value::String(text.to_string()))
}

// =============================================================================
// Result sets
// =============================================================================

fn column_db_type(ty: &OracleType) -> Option<DbType> {
    Some(match ty {
        OracleType::Number(prec, 0) if *prec > 0 && *prec <= 18 => DbType::Int64,
        OracleType::Number(_, _) => DbType::Decimal,
        OracleType::Int64 => DbType::Int64,
        OracleType::BinaryFloat | OracleType::BinaryDouble | OracleType::Float(_) => DbType::Double,
        OracleType::Varchar2(_)
        | OracleType::NVarchar2(_)
        | OracleType::Char(_)
        | OracleType::NChar(_)
        | OracleType::Long
        | OracleType::CLOB
        | OracleType::NCLOB
        | OracleType::Rowid => DbType::String,
        OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => DbType::Binary,
        OracleType::Date
        | OracleType::Timestamp(_)
        | OracleType::TimestampTZ(_)
        | OracleType::TimestampLTZ(_) => DbType::DateTime,
        OracleType::Boolean => DbType::Boolean,
        _ => return None,
    })
}

fn read_result_set(rows: ResultSet<Row>) -> DbResult<DataTable> {
    let types: Vec<OracleType> = rows
        .column_info()
        .iter()
        .map(|c| c.oracle_type().clone())
        .collect();
    let mut table = DataTable::new(
        rows.column_info()
            .iter()
            .map(|c| DataColumn::new(c.name(), column_db_type(c.oracle_type())))
            .collect(),
    );
    for row in rows {
        let row = row?;
        let values = row
            .sql_values()
            .iter()
            .zip(&types)
            .map(|(value, ty)| decode_value(value, ty))
            .collect::<DbResult<Vec<_>>>()?;
        table.push_row(values)?;
    }
    Ok(table)
}

fn decode_value(value: &SqlValue, ty: &OracleType) -> DbResult<Value> {
    if value.is_null()? {
        return Ok(Value::Null);
    }
    Ok(match column_db_type(ty) {
        Some(DbType::Int64) => Value::Int64(value.get()?),
        Some(DbType::Decimal) => parse_number(&value.get::<String>()?),
        Some(DbType::Double) => Value::Double(value.get()?),
        Some(DbType::Binary) => Value::Bytes(value.get()?),
        Some(DbType::Boolean) => Value::Bool(value.get()?),
        Some(DbType::DateTime) => match ty {
            OracleType::TimestampTZ(_) | OracleType::TimestampLTZ(_) => {
                Value::DateTime(value.get::<chrono::DateTime<FixedOffset>>()?.naive_utc())
            }
            _ => Value::DateTime(value.get()?),
        },
        _ => Value::String(value.get()?),
    })
}
