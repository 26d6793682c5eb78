//! SQL Server driver on tiberius.
//!
//! tiberius binds parameters positionally as `@P1, @P2, ...` and has no output
//! parameter support. Stored procedure calls therefore declare a variable per
//! output parameter, pass it with `OUTPUT` and select the variables back as a
//! trailing result set, which is consumed here and never returned.

use crate::db::Vendor;
use crate::db::driver::{DriverFactory, IsolationLevel, PreparedCommand, Session};
use crate::db::drivers::fill_outputs_from_row;
use crate::db::sql_text::{PlaceholderStyle, rewrite_named};
use crate::error::{DbError, DbResult};
use crate::models::{CommandType, DataColumn, DataTable, DbType, Parameter, ParameterDirection, Value};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use rust_decimal::Decimal;
use std::borrow::Cow;
use tiberius::numeric::Numeric;
use tiberius::{Client, ColumnData, ColumnType, Config, FromSql, IntoSql, Query, QueryItem, TokenRow};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

type MsClient = Client<Compat<TcpStream>>;

/// Factory for tiberius sessions. Connection strings are ADO.NET style.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDriver;

#[async_trait]
impl DriverFactory for SqlServerDriver {
    fn vendor(&self) -> Vendor {
        Vendor::SqlServer
    }

    async fn connect(&self, connection_string: &str) -> DbResult<Box<dyn Session>> {
        let config = Config::from_ado_string(connection_string)?;
        let client = connect_client(config).await?;
        debug!("SQL Server session opened");
        Ok(Box::new(SqlServerSession { client }))
    }
}

async fn connect_client(config: Config) -> DbResult<MsClient> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;

    match Client::connect(config.clone(), tcp.compat_write()).await {
        Ok(client) => Ok(client),
        // Azure SQL gateways redirect to the actual node
        Err(tiberius::error::Error::Routing { host, port }) => {
            debug!(%host, port, "Following SQL Server routing redirect");
            let mut config = config;
            config.host(&host);
            config.port(port);
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Ok(Client::connect(config, tcp.compat_write()).await?)
        }
        Err(e) => Err(e.into()),
    }
}

pub struct SqlServerSession {
    client: MsClient,
}

/// T-SQL batch to send plus the parameter indices to bind, in `@Pn` order.
#[derive(Debug, PartialEq, Eq)]
struct MsCommandText {
    sql: String,
    bind_order: Vec<usize>,
    /// The batch ends with a row holding output parameter values.
    selects_outputs: bool,
}

fn build_batch(command: &PreparedCommand<'_>) -> DbResult<MsCommandText> {
    Ok(match command.command_type {
        CommandType::Text => {
            let rewritten = rewrite_named(command.text, '@', command.parameters, PlaceholderStyle::AtP)?;
            MsCommandText {
                sql: rewritten.sql,
                bind_order: rewritten.bind_order,
                selects_outputs: false,
            }
        }
        CommandType::StoredProcedure => build_procedure_call(command.text.trim(), command.parameters),
    })
}

fn build_procedure_call(name: &str, parameters: &[Parameter]) -> MsCommandText {
    let mut declares = Vec::new();
    let mut args = Vec::new();
    let mut selects = Vec::new();
    let mut bind_order = Vec::new();

    for (idx, parameter) in parameters.iter().enumerate() {
        let bare = parameter.bare_name();
        if parameter.direction.is_output() {
            let var = format!("@__out_{bare}");
            let mut declare = format!("DECLARE {var} {}", sql_type(parameter));
            if parameter.direction == ParameterDirection::InputOutput {
                bind_order.push(idx);
                declare.push_str(&format!(" = {}", PlaceholderStyle::AtP.placeholder(bind_order.len())));
            }
            declares.push(declare);
            args.push(format!("@{bare} = {var} OUTPUT"));
            selects.push(format!("{var} AS [{bare}]"));
        } else {
            bind_order.push(idx);
            args.push(format!("@{bare} = {}", PlaceholderStyle::AtP.placeholder(bind_order.len())));
        }
    }

    let mut sql = String::new();
    for declare in &declares {
        sql.push_str(declare);
        sql.push_str(";\n");
    }
    sql.push_str("EXEC ");
    sql.push_str(name);
    if !args.is_empty() {
        sql.push(' ');
        sql.push_str(&args.join(", "));
    }
    if !selects.is_empty() {
        sql.push_str(";\nSELECT ");
        sql.push_str(&selects.join(", "));
    }

    MsCommandText {
        sql,
        bind_order,
        selects_outputs: !selects.is_empty(),
    }
}

/// Declared T-SQL type for an output variable.
fn sql_type(parameter: &Parameter) -> String {
    let sized = |base: &str| match parameter.size {
        Some(n) if n > 0 && n <= 4000 => format!("{base}({n})"),
        _ => format!("{base}(MAX)"),
    };
    match parameter.db_type.or_else(|| parameter.value_or_null().db_type()) {
        Some(DbType::Boolean) => "BIT".into(),
        Some(DbType::Int16) => "SMALLINT".into(),
        Some(DbType::Int32) => "INT".into(),
        Some(DbType::Int64) => "BIGINT".into(),
        Some(DbType::Double) => "FLOAT".into(),
        Some(DbType::Decimal) => "DECIMAL(38, 10)".into(),
        Some(DbType::Binary) => sized("VARBINARY"),
        Some(DbType::DateTime) => "DATETIME2".into(),
        Some(DbType::Guid) => "UNIQUEIDENTIFIER".into(),
        Some(DbType::String | DbType::Json | DbType::Object) | None => sized("NVARCHAR"),
    }
}

impl SqlServerSession {
    fn bound_query<'a>(batch: &'a MsCommandText, parameters: &[Parameter]) -> DbResult<Query<'a>> {
        let mut query = Query::new(batch.sql.as_str());
        for &idx in &batch.bind_order {
            bind_parameter(&mut query, &parameters[idx])?;
        }
        Ok(query)
    }

    async fn fetch_tables(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<Vec<DataTable>> {
        let batch = build_batch(command)?;
        let query = Self::bound_query(&batch, command.parameters)?;

        let mut stream = query.query(&mut self.client).await?;
        let mut tables: Vec<DataTable> = Vec::new();
        while let Some(item) = stream.try_next().await? {
            match item {
                QueryItem::Metadata(meta) => {
                    let columns = meta
                        .columns()
                        .iter()
                        .map(|c| DataColumn::new(c.name(), column_db_type(c.column_type())))
                        .collect();
                    tables.push(DataTable::new(columns));
                }
                QueryItem::Row(row) => {
                    let values = row
                        .into_iter()
                        .map(|cell| decode_cell(&cell))
                        .collect::<DbResult<Vec<_>>>()?;
                    if let Some(table) = tables.last_mut() {
                        table.push_row(values)?;
                    }
                }
            }
        }

        if batch.selects_outputs {
            let outputs = tables.pop();
            fill_outputs_from_row(command.parameters, outputs.as_ref());
        }
        Ok(tables)
    }
}

#[async_trait]
impl Session for SqlServerSession {
    /// Affected row count. Procedure calls with output parameters report 0,
    /// since their results are read as a stream rather than counted.
    async fn execute(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<u64> {
        let batch = build_batch(command)?;
        if batch.selects_outputs {
            self.fetch_tables(command).await?;
            return Ok(0);
        }
        let query = Self::bound_query(&batch, command.parameters)?;
        let result = query.execute(&mut self.client).await?;
        Ok(result.total())
    }

    async fn query(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<Vec<DataTable>> {
        self.fetch_tables(command).await
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> DbResult<()> {
        let sql = format!(
            "SET TRANSACTION ISOLATION LEVEL {}; BEGIN TRANSACTION",
            isolation.sql_name()
        );
        self.client.execute(sql, &[]).await?;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.client.execute("COMMIT TRANSACTION", &[]).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.client.execute("ROLLBACK TRANSACTION", &[]).await?;
        Ok(())
    }

    async fn bulk_insert(&mut self, table_name: &str, data: &DataTable, batch_size: usize) -> DbResult<u64> {
        let mut copied = 0u64;
        for (batch_no, chunk) in data.rows.chunks(batch_size.max(1)).enumerate() {
            let mut request = self.client.bulk_insert(table_name).await?;
            for row in chunk {
                let mut token_row = TokenRow::new();
                for (value, column) in row.iter().zip(&data.columns) {
                    token_row.push(to_column_data(value, column.db_type)?);
                }
                request.send(token_row).await?;
            }
            let result = request.finalize().await?;
            copied += result.total();
            debug!(table = %table_name, batch = batch_no, rows = chunk.len(), "Bulk copy batch committed");
        }
        info!(table = %table_name, rows = copied, "Bulk insert finished");
        Ok(copied)
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.client.close().await?;
        Ok(())
    }
}

// =============================================================================
// Values in and out
// =============================================================================

fn bind_parameter<'a>(query: &mut Query<'a>, parameter: &Parameter) -> DbResult<()> {
    match parameter.value_or_null() {
        Value::Null => bind_null(query, parameter.db_type),
        Value::Bool(v) => query.bind(*v),
        Value::Int16(v) => query.bind(*v),
        Value::Int32(v) => query.bind(*v),
        Value::Int64(v) => query.bind(*v),
        Value::Double(v) => query.bind(*v),
        Value::Decimal(v) => query.bind(to_numeric(v)),
        Value::String(v) => query.bind(v.clone()),
        Value::Bytes(v) => query.bind(v.clone()),
        Value::DateTime(v) => query.bind(*v),
        Value::Guid(v) => query.bind(*v),
        Value::Json(v) => query.bind(v.to_string()),
        Value::Array(_) => return Err(DbError::not_supported("Array parameters", Vendor::SqlServer)),
    }
    Ok(())
}

fn bind_null(query: &mut Query<'_>, db_type: Option<DbType>) {
    match db_type {
        Some(DbType::Boolean) => query.bind(None::<bool>),
        Some(DbType::Int16) => query.bind(None::<i16>),
        Some(DbType::Int32) => query.bind(None::<i32>),
        Some(DbType::Int64) => query.bind(None::<i64>),
        Some(DbType::Double) => query.bind(None::<f64>),
        Some(DbType::Decimal) => query.bind(None::<Numeric>),
        Some(DbType::Binary) => query.bind(None::<Vec<u8>>),
        Some(DbType::DateTime) => query.bind(None::<NaiveDateTime>),
        Some(DbType::Guid) => query.bind(None::<uuid::Uuid>),
        Some(DbType::String | DbType::Json | DbType::Object) | None => query.bind(None::<String>),
    }
}

fn to_numeric(value: &Decimal) -> Numeric {
    Numeric::new_with_scale(value.mantissa(), value.scale() as u8)
}

/// Bulk copy cell. Nulls take their type from the column declaration.
fn to_column_data(value: &Value, db_type: Option<DbType>) -> DbResult<ColumnData<'static>> {
    Ok(match value {
        Value::Null => match db_type {
            Some(DbType::Boolean) => ColumnData::Bit(None),
            Some(DbType::Int16) => ColumnData::I16(None),
            Some(DbType::Int32) => ColumnData::I32(None),
            Some(DbType::Int64) => ColumnData::I64(None),
            Some(DbType::Double) => ColumnData::F64(None),
            Some(DbType::Decimal) => ColumnData::Numeric(None),
            Some(DbType::Binary) => ColumnData::Binary(None),
            Some(DbType::DateTime) => ColumnData::DateTime2(None),
            Some(DbType::Guid) => ColumnData::Guid(None),
            Some(DbType::String | DbType::Json | DbType::Object) | None => ColumnData::String(None),
        },
        Value::Bool(v) => ColumnData::Bit(Some(*v)),
        Value::Int16(v) => ColumnData::I16(Some(*v)),
        Value::Int32(v) => ColumnData::I32(Some(*v)),
        Value::Int64(v) => ColumnData::I64(Some(*v)),
        Value::Double(v) => ColumnData::F64(Some(*v)),
        Value::Decimal(v) => ColumnData::Numeric(Some(to_numeric(v))),
        Value::String(v) => ColumnData::String(Some(Cow::Owned(v.clone()))),
        Value::Bytes(v) => ColumnData::Binary(Some(Cow::Owned(v.clone()))),
        Value::DateTime(v) => (*v).into_sql(),
        Value::Guid(v) => ColumnData::Guid(Some(*v)),
        Value::Json(v) => ColumnData::String(Some(Cow::Owned(v.to_string()))),
        Value::Array(_) => return Err(DbError::not_supported("Array values in bulk copy", Vendor::SqlServer)),
    })
}

fn column_db_type(column_type: ColumnType) -> Option<DbType> {
    Some(match column_type {
        ColumnType::Bit | ColumnType::Bitn => DbType::Boolean,
        ColumnType::Int1 | ColumnType::Int2 => DbType::Int16,
        ColumnType::Int4 => DbType::Int32,
        ColumnType::Int8 => DbType::Int64,
        ColumnType::Float4 | ColumnType::Float8 | ColumnType::Floatn => DbType::Double,
        ColumnType::Decimaln
        | ColumnType::Numericn
        | ColumnType::Money
        | ColumnType::Money4
        | ColumnType::Moneyn => DbType::Decimal,
        ColumnType::BigVarChar
        | ColumnType::BigChar
        | ColumnType::NVarchar
        | ColumnType::NChar
        | ColumnType::Text
        | ColumnType::NText
        | ColumnType::Xml => DbType::String,
        ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => DbType::Binary,
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2
        | ColumnType::Daten
        | ColumnType::DatetimeOffsetn => DbType::DateTime,
        ColumnType::Guid => DbType::Guid,
        _ => return None,
    })
}

fn opt<T: Into<Value>>(v: Option<T>) -> Value {
    v.map(Into::into).unwrap_or(Value::Null)
}

fn decode_numeric(n: Numeric) -> Value {
    Decimal::try_from_i128_with_scale(n.value(), n.scale() as u32)
        .map(Value::Decimal)
        .unwrap_or_else(|_| Value::String(n.to_string()))
}

fn decode_cell(data: &ColumnData<'static>) -> DbResult<Value> {
    Ok(match data {
        ColumnData::U8(v) => opt(v.map(i16::from)),
        ColumnData::I16(v) => opt(*v),
        ColumnData::I32(v) => opt(*v),
        ColumnData::I64(v) => opt(*v),
        ColumnData::F32(v) => opt(v.map(f64::from)),
        ColumnData::F64(v) => opt(*v),
        ColumnData::Bit(v) => opt(*v),
        ColumnData::String(v) => opt(v.as_ref().map(|s| s.to_string())),
        ColumnData::Guid(v) => opt(*v),
        ColumnData::Binary(v) => opt(v.as_ref().map(|b| b.to_vec())),
        ColumnData::Numeric(v) => v.map(decode_numeric).unwrap_or(Value::Null),
        ColumnData::Xml(v) => opt(v.as_ref().map(|x| x.as_ref().clone().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            opt(NaiveDateTime::from_sql(data)?)
        }
        ColumnData::Date(_) => opt(NaiveDate::from_sql(data)?.map(|d| d.and_time(NaiveTime::MIN))),
        ColumnData::DateTimeOffset(_) => {
            opt(chrono::DateTime::<Utc>::from_sql(data)?.map(|d| d.naive_utc()))
        }
        ColumnData::Time(_) => opt(NaiveTime::from_sql(data)?.map(|t| t.to_string())),
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_procedure_call_with_inputs() {
        let params = vec![
            Parameter::new("@id").with_value(1i32),
            Parameter::new("@name").with_value("x"),
        ];
        let batch = build_procedure_call("dbo.update_name", &params);
        assert_eq!(batch.sql, "EXEC dbo.update_name @id = @P1, @name = @P2");
        assert_eq!(batch.bind_order, vec![0, 1]);
        assert!(!batch.selects_outputs);
    }

    #[test]
    fn test_procedure_call_with_outputs() {
        let params = vec![
            Parameter::new("@id").with_value(7i32),
            Parameter::new("@total")
                .with_db_type(DbType::Int64)
                .with_direction(ParameterDirection::Output),
            Parameter::new("@label")
                .with_value("seed")
                .with_size(50)
                .with_direction(ParameterDirection::InputOutput),
        ];
        let batch = build_procedure_call("get_total", &params);
        assert_eq!(
            batch.sql,
            "DECLARE @__out_total BIGINT;\n\
             DECLARE @__out_label NVARCHAR(50) = @P2;\n\
             EXEC get_total @id = @P1, @total = @__out_total OUTPUT, @label = @__out_label OUTPUT;\n\
             SELECT @__out_total AS [total], @__out_label AS [label]"
        );
        assert_eq!(batch.bind_order, vec![0, 2]);
        assert!(batch.selects_outputs);
    }

    #[test]
    fn test_procedure_without_parameters() {
        let batch = build_procedure_call("dbo.ping", &[]);
        assert_eq!(batch.sql, "EXEC dbo.ping");
        assert!(batch.bind_order.is_empty());
    }

    #[test]
    fn test_decode_cells() {
        assert_eq!(decode_cell(&ColumnData::I32(Some(5))).unwrap(), Value::Int32(5));
        assert_eq!(decode_cell(&ColumnData::I32(None)).unwrap(), Value::Null);
        assert_eq!(decode_cell(&ColumnData::U8(Some(200))).unwrap(), Value::Int16(200));
        assert_eq!(
            decode_cell(&ColumnData::String(Some(Cow::Borrowed("abc")))).unwrap(),
            Value::String("abc".into())
        );
        assert_eq!(
            decode_cell(&ColumnData::Numeric(Some(Numeric::new_with_scale(12345, 2)))).unwrap(),
            Value::Decimal(Decimal::new(12345, 2))
        );
    }

    #[test]
    fn test_numeric_round_trip_of_decimal_scale() {
        let n = to_numeric(&Decimal::new(-505, 1));
        assert_eq!(n.value(), -505);
        assert_eq!(n.scale(), 1);
    }
}
