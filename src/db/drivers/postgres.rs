//! PostgreSQL driver on a single sqlx connection.
//!
//! Commands with parameters run as one prepared statement and produce exactly
//! one result set. Parameterless text runs on the simple query protocol, which
//! allows several statements per batch and yields one result set per statement
//! that returns rows. Column names come from the first row; a result set with
//! no rows is described with a separate prepare so it keeps its columns.

use crate::db::Vendor;
use crate::db::driver::{DriverFactory, IsolationLevel, PreparedCommand, Session};
use crate::db::drivers::fill_outputs_from_row;
use crate::db::sql_text::{PlaceholderStyle, SourceMap, input_positions, rewrite_named, tokenize};
use crate::error::{DbError, DbResult};
use crate::models::{CommandType, DataColumn, DataTable, DbType, Parameter, PgDbType, Value};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Word};
use sqlx::postgres::{PgArguments, PgColumn, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, Connection as _, Either, Executor, Postgres, Row, Statement as _, TypeInfo};
use tracing::{debug, warn};
use uuid::Uuid;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Factory for sqlx PostgreSQL sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

#[async_trait]
impl DriverFactory for PostgresDriver {
    fn vendor(&self) -> Vendor {
        Vendor::Postgres
    }

    async fn connect(&self, connection_string: &str) -> DbResult<Box<dyn Session>> {
        let conn = PgConnection::connect(connection_string).await?;
        debug!("PostgreSQL session opened");
        Ok(Box::new(PostgresSession { conn }))
    }
}

pub struct PostgresSession {
    conn: PgConnection,
}

/// SQL text to send plus the parameter indices to bind, in placeholder order.
struct PgCommandText {
    sql: String,
    bind_order: Vec<usize>,
}

fn build_statement(command: &PreparedCommand<'_>) -> DbResult<PgCommandText> {
    Ok(match command.command_type {
        CommandType::Text => {
            let rewritten = rewrite_named(
                command.text,
                '@',
                command.parameters,
                PlaceholderStyle::Dollar,
            )?;
            PgCommandText {
                sql: rewritten.sql,
                bind_order: rewritten.bind_order,
            }
        }
        CommandType::StoredProcedure => {
            let bind_order = input_positions(command.parameters);
            let args = (1..=bind_order.len())
                .map(|n| PlaceholderStyle::Dollar.placeholder(n))
                .collect::<Vec<_>>()
                .join(", ");
            PgCommandText {
                sql: format!("SELECT * FROM {}({args})", command.text.trim()),
                bind_order,
            }
        }
    })
}

/// One statement of a simple-protocol batch.
#[derive(Debug, PartialEq, Eq)]
struct BatchStatement {
    text: String,
    /// Can produce a result set even when it matches no rows.
    returns_rows: bool,
}

const ROW_STATEMENTS: &[&str] = &["SELECT", "WITH", "VALUES", "TABLE", "SHOW", "EXPLAIN", "FETCH"];

fn is_word(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(Word { value, quote_style: None, .. }) if value.eq_ignore_ascii_case(keyword))
}

/// Split a batch on top-level semicolons. Statements that hold only
/// whitespace or comments are dropped, as the server ignores them too.
fn split_batch(sql: &str) -> DbResult<Vec<BatchStatement>> {
    let tokens = tokenize(sql, &PostgreSqlDialect {})?;
    let map = SourceMap::new(sql);

    let mut statements = Vec::new();
    for chunk in tokens.split(|t| t.token == Token::SemiColon) {
        let significant: Vec<_> = chunk
            .iter()
            .filter(|t| !matches!(t.token, Token::Whitespace(_) | Token::EOF))
            .collect();
        let (Some(first), Some(last)) = (significant.first(), significant.last()) else {
            continue;
        };
        let returns_rows = matches!(first.token, Token::LParen)
            || ROW_STATEMENTS.iter().any(|k| is_word(&first.token, k))
            || significant.iter().any(|t| is_word(&t.token, "RETURNING"));
        let start = map.offset(first.span.start);
        let end = map.offset(last.span.end);
        statements.push(BatchStatement {
            text: sql[start..end].to_string(),
            returns_rows,
        });
    }
    Ok(statements)
}

/// Simple-protocol output in statement order; empty result sets are resolved
/// once the batch has finished.
enum BatchResult {
    Rows(DataTable),
    Empty(usize),
}

impl PostgresSession {
    async fn fetch_tables(&mut self, command: &PreparedCommand<'_>) -> DbResult<(Vec<DataTable>, u64)> {
        let statement = build_statement(command)?;

        if statement.bind_order.is_empty() {
            return self.fetch_simple(&statement.sql).await;
        }

        let mut query = sqlx::query(&statement.sql);
        for &idx in &statement.bind_order {
            query = bind_parameter(query, &command.parameters[idx])?;
        }
        let rows = query.fetch_all(&mut self.conn).await?;

        let mut table = match rows.first() {
            Some(row) => table_for_row(row),
            None => self.describe_empty(&statement.sql).await.unwrap_or_default(),
        };
        for row in &rows {
            table.push_row(decode_row(row)?)?;
        }
        let count = table.len() as u64;
        Ok((vec![table], count))
    }

    /// Run parameterless SQL on the simple protocol, splitting result sets per statement.
    async fn fetch_simple(&mut self, sql: &str) -> DbResult<(Vec<DataTable>, u64)> {
        let statements = split_batch(sql)?;
        let mut results = Vec::new();
        let mut current: Option<DataTable> = None;
        let mut affected = 0u64;
        let mut index = 0;

        {
            let mut stream = (&mut self.conn).fetch_many(sql);
            while let Some(item) = stream.try_next().await? {
                match item {
                    Either::Left(done) => {
                        affected += done.rows_affected();
                        match current.take() {
                            Some(table) => results.push(BatchResult::Rows(table)),
                            None if statements.get(index).is_some_and(|s| s.returns_rows) => {
                                results.push(BatchResult::Empty(index))
                            }
                            None => {}
                        }
                        index += 1;
                    }
                    Either::Right(row) => {
                        let table = current.get_or_insert_with(|| table_for_row(&row));
                        table.push_row(decode_row(&row)?)?;
                    }
                }
            }
        }
        if let Some(table) = current.take() {
            results.push(BatchResult::Rows(table));
        }

        let mut tables = Vec::with_capacity(results.len());
        for result in results {
            match result {
                BatchResult::Rows(table) => tables.push(table),
                BatchResult::Empty(idx) => {
                    if let Some(table) = self.describe_empty(&statements[idx].text).await {
                        tables.push(table);
                    }
                }
            }
        }
        Ok((tables, affected))
    }

    /// Columns of a statement that matched no rows, or `None` if it has no
    /// result set at all.
    async fn describe_empty(&mut self, sql: &str) -> Option<DataTable> {
        match (&mut self.conn).prepare(sql).await {
            Ok(statement) if statement.columns().is_empty() => None,
            Ok(statement) => Some(table_for_columns(statement.columns())),
            Err(e) => {
                debug!(error = %e, "Could not describe empty result set");
                Some(DataTable::default())
            }
        }
    }
}

#[async_trait]
impl Session for PostgresSession {
    async fn execute(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<u64> {
        if command.command_type == CommandType::StoredProcedure {
            let (tables, rows) = self.fetch_tables(command).await?;
            fill_outputs_from_row(command.parameters, tables.first());
            return Ok(rows);
        }

        let statement = build_statement(command)?;
        if statement.bind_order.is_empty() {
            let done = (&mut self.conn).execute(statement.sql.as_str()).await?;
            return Ok(done.rows_affected());
        }

        let mut query = sqlx::query(&statement.sql);
        for &idx in &statement.bind_order {
            query = bind_parameter(query, &command.parameters[idx])?;
        }
        let done = query.execute(&mut self.conn).await?;
        Ok(done.rows_affected())
    }

    async fn query(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<Vec<DataTable>> {
        let (tables, _) = self.fetch_tables(command).await?;
        if command.command_type == CommandType::StoredProcedure {
            fill_outputs_from_row(command.parameters, tables.first());
        }
        Ok(tables)
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> DbResult<()> {
        // PostgreSQL's repeatable read is snapshot isolation
        let level = match isolation {
            IsolationLevel::Snapshot => IsolationLevel::RepeatableRead,
            other => other,
        };
        let sql = format!("BEGIN ISOLATION LEVEL {}", level.sql_name());
        (&mut self.conn).execute(sql.as_str()).await?;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        (&mut self.conn).execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        (&mut self.conn).execute("ROLLBACK").await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}

// =============================================================================
// Parameter binding
// =============================================================================

/// Native type a parameter binds as: its PostgreSQL tag, else one derived from
/// the semantic type, else inferred from the value.
fn bind_type(parameter: &Parameter) -> Option<PgDbType> {
    if let Some(pg) = parameter.pg_type() {
        return Some(pg.clone());
    }
    parameter
        .db_type
        .or_else(|| parameter.value_or_null().db_type())
        .and_then(pg_type_for)
}

fn pg_type_for(db_type: DbType) -> Option<PgDbType> {
    Some(match db_type {
        DbType::Boolean => PgDbType::Boolean,
        DbType::Int16 => PgDbType::Smallint,
        DbType::Int32 => PgDbType::Integer,
        DbType::Int64 => PgDbType::Bigint,
        DbType::Double => PgDbType::Double,
        DbType::Decimal => PgDbType::Numeric,
        DbType::String => PgDbType::Text,
        DbType::Binary => PgDbType::Bytea,
        DbType::DateTime => PgDbType::Timestamp,
        DbType::Guid => PgDbType::Uuid,
        DbType::Json => PgDbType::Jsonb,
        DbType::Object => return None,
    })
}

fn bind_parameter<'q>(query: PgQuery<'q>, parameter: &Parameter) -> DbResult<PgQuery<'q>> {
    let target = bind_type(parameter);
    let value = parameter.value_or_null();
    let mismatch = || {
        DbError::invalid_argument(
            "parameter",
            format!(
                "{} cannot bind a {} value as {}",
                parameter.name,
                value.type_name(),
                target.as_ref().map_or_else(|| "unknown".to_string(), PgDbType::sql_name)
            ),
        )
    };

    Ok(match (value, &target) {
        (Value::Null, Some(t)) => bind_null(query, t),
        (Value::Null, None) => query.bind(None::<String>),

        // Integers widen or convert to the declared numeric type
        (v, Some(PgDbType::Bigint)) if v.as_i64().is_some() => query.bind(v.as_i64()),
        (v, Some(PgDbType::Integer)) if v.as_i64().is_some() => {
            query.bind(v.as_i64().and_then(|n| i32::try_from(n).ok()).ok_or_else(mismatch)?)
        }
        (v, Some(PgDbType::Smallint)) if v.as_i64().is_some() => {
            query.bind(v.as_i64().and_then(|n| i16::try_from(n).ok()).ok_or_else(mismatch)?)
        }
        (v, Some(PgDbType::Numeric)) if v.as_i64().is_some() => {
            query.bind(v.as_i64().map(Decimal::from))
        }
        (v, Some(PgDbType::Double)) if v.as_i64().is_some() => {
            query.bind(v.as_i64().map(|n| n as f64))
        }

        // JSON text is sent as a document, not as text
        (Value::String(s), Some(PgDbType::Json | PgDbType::Jsonb)) => {
            let doc = serde_json::from_str::<JsonValue>(s).unwrap_or_else(|_| JsonValue::String(s.clone()));
            query.bind(Json(doc))
        }

        (Value::Bool(v), _) => query.bind(*v),
        (Value::Int16(v), _) => query.bind(*v),
        (Value::Int32(v), _) => query.bind(*v),
        (Value::Int64(v), _) => query.bind(*v),
        (Value::Double(v), _) => query.bind(*v),
        (Value::Decimal(v), _) => query.bind(*v),
        (Value::String(v), _) => query.bind(v.clone()),
        (Value::Bytes(v), _) => query.bind(v.clone()),
        (Value::DateTime(v), _) => query.bind(*v),
        (Value::Guid(v), _) => query.bind(*v),
        (Value::Json(v), _) => query.bind(Json(v.clone())),
        (Value::Array(items), Some(PgDbType::Array(element))) => bind_array(query, element, items, mismatch)?,
        (Value::Array(items), _) => {
            let element = items
                .iter()
                .find_map(|v| v.db_type().and_then(pg_type_for))
                .unwrap_or(PgDbType::Text);
            bind_array(query, &element, items, mismatch)?
        }
    })
}

fn bind_null<'q>(query: PgQuery<'q>, target: &PgDbType) -> PgQuery<'q> {
    match target {
        PgDbType::Boolean => query.bind(None::<bool>),
        PgDbType::Smallint => query.bind(None::<i16>),
        PgDbType::Integer => query.bind(None::<i32>),
        PgDbType::Bigint => query.bind(None::<i64>),
        PgDbType::Double => query.bind(None::<f64>),
        PgDbType::Numeric => query.bind(None::<Decimal>),
        PgDbType::Text | PgDbType::Varchar => query.bind(None::<String>),
        PgDbType::Bytea => query.bind(None::<Vec<u8>>),
        PgDbType::Timestamp => query.bind(None::<NaiveDateTime>),
        PgDbType::Uuid => query.bind(None::<Uuid>),
        PgDbType::Json | PgDbType::Jsonb => query.bind(None::<Json<JsonValue>>),
        PgDbType::Array(element) => match element.as_ref() {
            PgDbType::Boolean => query.bind(None::<Vec<bool>>),
            PgDbType::Smallint => query.bind(None::<Vec<i16>>),
            PgDbType::Integer => query.bind(None::<Vec<i32>>),
            PgDbType::Bigint => query.bind(None::<Vec<i64>>),
            PgDbType::Double => query.bind(None::<Vec<f64>>),
            PgDbType::Numeric => query.bind(None::<Vec<Decimal>>),
            PgDbType::Uuid => query.bind(None::<Vec<Uuid>>),
            PgDbType::Timestamp => query.bind(None::<Vec<NaiveDateTime>>),
            _ => query.bind(None::<Vec<String>>),
        },
    }
}

fn bind_array<'q>(
    query: PgQuery<'q>,
    element: &PgDbType,
    items: &[Value],
    mismatch: impl Fn() -> DbError,
) -> DbResult<PgQuery<'q>> {
    fn collect<T>(items: &[Value], pick: impl Fn(&Value) -> Option<T>) -> Option<Vec<Option<T>>> {
        items
            .iter()
            .map(|v| if v.is_null() { Some(None) } else { pick(v).map(Some) })
            .collect()
    }

    let bound = match element {
        PgDbType::Boolean => collect(items, |v| match v {
            Value::Bool(b) => Some(*b),
            _ => None,
        })
        .map(|a| query.bind(a)),
        PgDbType::Smallint => {
            collect(items, |v| v.as_i64().and_then(|n| i16::try_from(n).ok())).map(|a| query.bind(a))
        }
        PgDbType::Integer => {
            collect(items, |v| v.as_i64().and_then(|n| i32::try_from(n).ok())).map(|a| query.bind(a))
        }
        PgDbType::Bigint => collect(items, Value::as_i64).map(|a| query.bind(a)),
        PgDbType::Double => collect(items, |v| match v {
            Value::Double(d) => Some(*d),
            other => other.as_i64().map(|n| n as f64),
        })
        .map(|a| query.bind(a)),
        PgDbType::Numeric => collect(items, |v| match v {
            Value::Decimal(d) => Some(*d),
            other => other.as_i64().map(Decimal::from),
        })
        .map(|a| query.bind(a)),
        PgDbType::Text | PgDbType::Varchar => collect(items, |v| match v {
            Value::String(s) => Some(s.clone()),
            _ => None,
        })
        .map(|a| query.bind(a)),
        PgDbType::Uuid => collect(items, |v| match v {
            Value::Guid(g) => Some(*g),
            _ => None,
        })
        .map(|a| query.bind(a)),
        PgDbType::Timestamp => collect(items, |v| match v {
            Value::DateTime(d) => Some(*d),
            _ => None,
        })
        .map(|a| query.bind(a)),
        _ => None,
    };
    bound.ok_or_else(mismatch)
}

// =============================================================================
// Row decoding
// =============================================================================

fn column_db_type(type_name: &str) -> Option<DbType> {
    Some(match type_name {
        "BOOL" => DbType::Boolean,
        "INT2" => DbType::Int16,
        "INT4" => DbType::Int32,
        "INT8" => DbType::Int64,
        "FLOAT4" | "FLOAT8" => DbType::Double,
        "NUMERIC" => DbType::Decimal,
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT" => DbType::String,
        "BYTEA" => DbType::Binary,
        "TIMESTAMP" | "TIMESTAMPTZ" | "DATE" => DbType::DateTime,
        "UUID" => DbType::Guid,
        "JSON" | "JSONB" => DbType::Json,
        name if name.ends_with("[]") => DbType::Object,
        _ => return None,
    })
}

fn table_for_row(row: &PgRow) -> DataTable {
    table_for_columns(row.columns())
}

fn table_for_columns(columns: &[PgColumn]) -> DataTable {
    DataTable::new(
        columns
            .iter()
            .map(|c| DataColumn::new(c.name(), column_db_type(c.type_info().name())))
            .collect(),
    )
}

fn decode_row(row: &PgRow) -> DbResult<Vec<Value>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| decode_column(row, idx, col.type_info().name()))
        .collect()
}

fn opt<T: Into<Value>>(v: Option<T>) -> Value {
    v.map(Into::into).unwrap_or(Value::Null)
}

fn array<T: Into<Value>>(v: Option<Vec<Option<T>>>) -> Value {
    match v {
        Some(items) => Value::Array(items.into_iter().map(opt).collect()),
        None => Value::Null,
    }
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> DbResult<Value> {
    Ok(match type_name {
        "BOOL" => opt(row.try_get::<Option<bool>, _>(idx)?),
        "INT2" => opt(row.try_get::<Option<i16>, _>(idx)?),
        "INT4" => opt(row.try_get::<Option<i32>, _>(idx)?),
        "INT8" => opt(row.try_get::<Option<i64>, _>(idx)?),
        "FLOAT4" => opt(row.try_get::<Option<f32>, _>(idx)?.map(f64::from)),
        "FLOAT8" => opt(row.try_get::<Option<f64>, _>(idx)?),
        "NUMERIC" => opt(row.try_get::<Option<Decimal>, _>(idx)?),
        "BYTEA" => opt(row.try_get::<Option<Vec<u8>>, _>(idx)?),
        "TIMESTAMP" => opt(row.try_get::<Option<NaiveDateTime>, _>(idx)?),
        "TIMESTAMPTZ" => opt(
            row.try_get::<Option<DateTime<Utc>>, _>(idx)?
                .map(|d| d.naive_utc()),
        ),
        "DATE" => opt(
            row.try_get::<Option<NaiveDate>, _>(idx)?
                .map(|d| d.and_time(NaiveTime::MIN)),
        ),
        "UUID" => opt(row.try_get::<Option<Uuid>, _>(idx)?),
        "JSON" | "JSONB" => opt(row.try_get::<Option<JsonValue>, _>(idx)?),
        "BOOL[]" => array(row.try_get::<Option<Vec<Option<bool>>>, _>(idx)?),
        "INT2[]" => array(row.try_get::<Option<Vec<Option<i16>>>, _>(idx)?),
        "INT4[]" => array(row.try_get::<Option<Vec<Option<i32>>>, _>(idx)?),
        "INT8[]" => array(row.try_get::<Option<Vec<Option<i64>>>, _>(idx)?),
        "FLOAT8[]" => array(row.try_get::<Option<Vec<Option<f64>>>, _>(idx)?),
        "NUMERIC[]" => array(row.try_get::<Option<Vec<Option<Decimal>>>, _>(idx)?),
        "TEXT[]" | "VARCHAR[]" => array(row.try_get::<Option<Vec<Option<String>>>, _>(idx)?),
        "UUID[]" => array(row.try_get::<Option<Vec<Option<Uuid>>>, _>(idx)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT" => {
            opt(row.try_get::<Option<String>, _>(idx)?)
        }
        // Anything else is surfaced as its text form
        other => match row.try_get_unchecked::<Option<String>, _>(idx) {
            Ok(v) => opt(v),
            Err(e) => {
                warn!(column = idx, type_name = other, error = %e, "Unsupported column type, returning null");
                Value::Null
            }
        },
    })
}
