//! The vendor-neutral execution facade.
//!
//! A [`DbHelper`] holds one vendor configuration: the driver factory, the
//! parameter-name prefix and the default command timeout. Every execute
//! operation comes in three entry points:
//!
//! - `execute_*(connection_string, ..)`: the facade creates, opens and closes
//!   the connection.
//! - `execute_*_on(&mut Connection, ..)`: the caller owns the connection. It is
//!   only closed if it was closed on entry and the facade had to open it.
//! - `execute_*_in(&mut DbTransaction, ..)`: the command joins the transaction.
//!
//! A connection opened during a call is closed on every exit path, except when
//! it is handed to the returned [`DataReader`]. A command that times out
//! leaves its session mid-call, so the session is dropped and the connection
//! reports closed, whoever opened it.

use crate::config::{BULK_COPY_BATCH_SIZE, DEFAULT_COMMAND_TIMEOUT_SECS, HelperConfig};
use crate::db::connection::{Connection, DbTransaction};
use crate::db::data_reader::DataReader;
use crate::db::driver::{DriverFactory, IsolationLevel, PreparedCommand};
use crate::db::Vendor;
use crate::error::{DbError, DbResult};
use crate::models::{
    Command, DataSet, DataTable, DbType, OracleDbType, Parameter, ParameterDirection,
    PgArrayElement, PgDbType, Value, VendorType,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Who closes a connection once a command finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    /// The facade opened it during this call.
    OpenedHere,
    CallerOwned,
}

/// Vendor-neutral command execution and parameter creation.
#[derive(Debug, Clone)]
pub struct DbHelper {
    vendor: Vendor,
    factory: Arc<dyn DriverFactory>,
    default_timeout: u32,
}

impl Default for DbHelper {
    fn default() -> Self {
        Self::new(Vendor::default())
    }
}

impl DbHelper {
    /// Create a facade for `vendor` using its built-in driver.
    pub fn new(vendor: Vendor) -> Self {
        Self {
            vendor,
            factory: vendor.driver(),
            default_timeout: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }

    /// Create a facade around a custom driver factory. The vendor is the factory's.
    pub fn with_factory(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            vendor: factory.vendor(),
            factory,
            default_timeout: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }

    pub fn from_config(config: &HelperConfig) -> Self {
        let mut helper = Self::new(config.vendor);
        helper.set_default_timeout(config.default_timeout_secs);
        helper
    }

    // =========================================================================
    // Vendor and timeout configuration
    // =========================================================================

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    /// Switch vendor, repointing the driver factory and parameter prefix.
    pub fn set_vendor(&mut self, vendor: Vendor) {
        debug!(from = %self.vendor, to = %vendor, "Switching vendor");
        self.vendor = vendor;
        self.factory = vendor.driver();
    }

    /// The active driver factory.
    pub fn factory(&self) -> &Arc<dyn DriverFactory> {
        &self.factory
    }

    pub fn parameter_prefix(&self) -> &'static str {
        self.vendor.parameter_prefix()
    }

    /// Prefix `name` with the vendor's parameter prefix unless already present.
    pub fn normalize_parameter_name(&self, name: &str) -> String {
        self.vendor.normalize_parameter_name(name)
    }

    /// Default command timeout in seconds.
    pub fn default_timeout(&self) -> u32 {
        self.default_timeout
    }

    /// Set the default command timeout. Values that are not positive are ignored.
    pub fn set_default_timeout(&mut self, seconds: i64) {
        if seconds > 0 {
            self.default_timeout = u32::try_from(seconds).unwrap_or(u32::MAX);
        }
    }

    /// Effective timeout for `command`: its override, else the default.
    pub fn command_timeout(&self, command: &Command) -> u32 {
        command.timeout_override().unwrap_or(self.default_timeout)
    }

    /// Create a closed connection through the active driver.
    pub fn create_connection(&self, connection_string: &str) -> DbResult<Connection> {
        Connection::new(Arc::clone(&self.factory), connection_string)
    }

    // =========================================================================
    // Parameter factory
    // =========================================================================

    /// A typed parameter with no value yet.
    pub fn create_parameter(&self, name: &str, db_type: DbType) -> Parameter {
        Parameter::new(self.normalize_parameter_name(name)).with_db_type(db_type)
    }

    /// A typed parameter with a declared size for variable-length types.
    pub fn create_parameter_with_size(&self, name: &str, db_type: DbType, size: u32) -> Parameter {
        self.create_parameter(name, db_type).with_size(size)
    }

    /// An input parameter whose type is inferred from `value`. `None` becomes null.
    pub fn create_parameter_with_value(&self, name: &str, value: impl Into<Value>) -> Parameter {
        Parameter::new(self.normalize_parameter_name(name)).with_value(value)
    }

    pub fn create_parameter_full(
        &self,
        name: &str,
        db_type: DbType,
        value: impl Into<Value>,
        direction: ParameterDirection,
    ) -> Parameter {
        self.create_parameter(name, db_type)
            .with_value(value)
            .with_direction(direction)
    }

    /// A parameter carrying an Oracle native type. Oracle only.
    pub fn create_oracle_parameter(
        &self,
        name: &str,
        oracle_type: OracleDbType,
        value: impl Into<Value>,
        direction: ParameterDirection,
    ) -> DbResult<Parameter> {
        self.require_vendor(Vendor::Oracle, "Oracle parameters")?;
        let mut parameter = Parameter::new(self.normalize_parameter_name(name))
            .with_vendor_type(VendorType::Oracle(oracle_type))
            .with_direction(direction);
        parameter.db_type = oracle_type.db_type();
        if direction.is_input() {
            parameter.value = Some(value.into());
        }
        Ok(parameter)
    }

    /// An output ref cursor parameter. Oracle only.
    ///
    /// Cursor rows come back as additional result sets of the command.
    pub fn create_ref_cursor_parameter(&self, name: &str) -> DbResult<Parameter> {
        self.require_vendor(Vendor::Oracle, "Ref cursor parameters")?;
        Ok(Parameter::new(self.normalize_parameter_name(name))
            .with_vendor_type(VendorType::Oracle(OracleDbType::RefCursor))
            .with_direction(ParameterDirection::Output))
    }

    /// A parameter carrying a PostgreSQL native type. PostgreSQL only.
    ///
    /// JSON and JSONB values are passed through as-is; the driver serializes them.
    pub fn create_postgres_parameter(
        &self,
        name: &str,
        pg_type: PgDbType,
        value: impl Into<Value>,
    ) -> DbResult<Parameter> {
        self.require_vendor(Vendor::Postgres, "PostgreSQL parameters")?;
        let db_type = pg_type.db_type();
        Ok(Parameter::new(self.normalize_parameter_name(name))
            .with_db_type(db_type)
            .with_value(value)
            .with_vendor_type(VendorType::Postgres(pg_type)))
    }

    /// An array parameter (`integer[]`, `text[]`, ...). PostgreSQL only.
    pub fn create_array_parameter<T, I>(&self, name: &str, values: I) -> DbResult<Parameter>
    where
        T: PgArrayElement,
        I: IntoIterator<Item = T>,
    {
        self.require_vendor(Vendor::Postgres, "Array parameters")?;
        let items: Vec<Value> = values.into_iter().map(Into::into).collect();
        Ok(Parameter::new(self.normalize_parameter_name(name))
            .with_db_type(DbType::Object)
            .with_value(Value::Array(items))
            .with_vendor_type(VendorType::Postgres(PgDbType::array_of(T::pg_type()))))
    }

    fn require_vendor(&self, vendor: Vendor, what: &str) -> DbResult<()> {
        if self.vendor == vendor {
            Ok(())
        } else {
            Err(DbError::invalid_operation(format!(
                "{what} require the {vendor} vendor, but {} is active",
                self.vendor
            )))
        }
    }

    // =========================================================================
    // Non-query
    // =========================================================================

    /// Execute a command and return the affected row count.
    pub async fn execute_non_query(
        &self,
        connection_string: &str,
        command: &mut Command,
    ) -> DbResult<u64> {
        let mut connection = self.create_connection(connection_string)?;
        self.execute_non_query_on(&mut connection, command).await
    }

    pub async fn execute_non_query_on(
        &self,
        connection: &mut Connection,
        command: &mut Command,
    ) -> DbResult<u64> {
        let ownership = self.prepare(connection, command).await?;
        let result = self.run_execute(connection, command).await;
        release(connection, ownership, result).await
    }

    pub async fn execute_non_query_in(
        &self,
        transaction: &mut DbTransaction,
        command: &mut Command,
    ) -> DbResult<u64> {
        let connection = transaction.connection_for_command()?;
        self.execute_non_query_on(connection, command).await
    }

    // =========================================================================
    // Dataset
    // =========================================================================

    /// Execute a command and materialize every result set.
    pub async fn execute_dataset(
        &self,
        connection_string: &str,
        command: &mut Command,
    ) -> DbResult<DataSet> {
        let mut connection = self.create_connection(connection_string)?;
        self.execute_dataset_on(&mut connection, command).await
    }

    pub async fn execute_dataset_on(
        &self,
        connection: &mut Connection,
        command: &mut Command,
    ) -> DbResult<DataSet> {
        let ownership = self.prepare(connection, command).await?;
        let result = self.run_query(connection, command, "dataset").await;
        let result = result.map(|tables| {
            command.finish();
            DataSet::new(tables)
        });
        release(connection, ownership, result).await
    }

    pub async fn execute_dataset_in(
        &self,
        transaction: &mut DbTransaction,
        command: &mut Command,
    ) -> DbResult<DataSet> {
        let connection = transaction.connection_for_command()?;
        self.execute_dataset_on(connection, command).await
    }

    // =========================================================================
    // Reader
    // =========================================================================

    /// Execute a command and return a forward-only reader.
    ///
    /// The reader owns the connection it was created with and closes it when
    /// the reader is closed.
    pub async fn execute_reader(
        &self,
        connection_string: &str,
        command: &mut Command,
    ) -> DbResult<DataReader> {
        let mut connection = self.create_connection(connection_string)?;
        self.execute_reader_on(&mut connection, command).await
    }

    /// Execute a command on `connection` and return a forward-only reader.
    ///
    /// If `connection` was closed on entry, the facade opens it and moves the
    /// session into the reader: `connection` reports closed afterwards and
    /// closing the reader closes the session. An already open connection is
    /// left open and untouched.
    pub async fn execute_reader_on(
        &self,
        connection: &mut Connection,
        command: &mut Command,
    ) -> DbResult<DataReader> {
        let ownership = self.prepare(connection, command).await?;
        match self.run_query(connection, command, "reader").await {
            Ok(tables) => {
                let session = match ownership {
                    Ownership::OpenedHere => connection.take_session(),
                    Ownership::CallerOwned => None,
                };
                Ok(DataReader::new(tables, session))
            }
            Err(e) => release(connection, ownership, Err(e)).await,
        }
    }

    pub async fn execute_reader_in(
        &self,
        transaction: &mut DbTransaction,
        command: &mut Command,
    ) -> DbResult<DataReader> {
        let connection = transaction.connection_for_command()?;
        self.execute_reader_on(connection, command).await
    }

    // =========================================================================
    // Scalar
    // =========================================================================

    /// Execute a command and return the first column of the first row, or null.
    pub async fn execute_scalar(
        &self,
        connection_string: &str,
        command: &mut Command,
    ) -> DbResult<Value> {
        let mut connection = self.create_connection(connection_string)?;
        self.execute_scalar_on(&mut connection, command).await
    }

    pub async fn execute_scalar_on(
        &self,
        connection: &mut Connection,
        command: &mut Command,
    ) -> DbResult<Value> {
        let ownership = self.prepare(connection, command).await?;
        let result = self.run_query(connection, command, "scalar").await;
        let result = result.map(|tables| {
            command.finish();
            tables.first().map(DataTable::scalar).unwrap_or(Value::Null)
        });
        release(connection, ownership, result).await
    }

    pub async fn execute_scalar_in(
        &self,
        transaction: &mut DbTransaction,
        command: &mut Command,
    ) -> DbResult<Value> {
        let connection = transaction.connection_for_command()?;
        self.execute_scalar_on(connection, command).await
    }

    // =========================================================================
    // Transactions and bulk copy
    // =========================================================================

    /// Open a dedicated connection and start a transaction on it.
    ///
    /// The isolation level defaults to read committed.
    pub async fn begin_transaction(
        &self,
        connection_string: &str,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<DbTransaction> {
        let connection = self.create_connection(connection_string)?;
        DbTransaction::begin(connection, isolation.unwrap_or_default()).await
    }

    /// Copy `data` into `table_name` in batches. SQL Server only.
    ///
    /// The column layout of `data` must match the destination table.
    pub async fn bulk_insert(
        &self,
        connection_string: &str,
        table_name: &str,
        data: &DataTable,
    ) -> DbResult<u64> {
        if !self.vendor.supports_bulk_copy() {
            return Err(DbError::not_supported("Bulk insert", self.vendor));
        }
        if table_name.trim().is_empty() {
            return Err(DbError::invalid_argument(
                "table_name",
                "destination table name must not be empty",
            ));
        }
        let mut connection = self.create_connection(connection_string)?;
        connection.open().await?;

        info!(
            table = %table_name,
            rows = data.len(),
            batch_size = BULK_COPY_BATCH_SIZE,
            timeout_secs = self.default_timeout,
            "Starting bulk insert"
        );
        let result = with_timeout("bulk insert", self.default_timeout, async {
            connection
                .session_mut()?
                .bulk_insert(table_name, data, BULK_COPY_BATCH_SIZE)
                .await
        })
        .await;
        discard_on_timeout(&mut connection, &result);
        release(&mut connection, Ownership::OpenedHere, result).await
    }

    // =========================================================================
    // Command preparation and execution
    // =========================================================================

    /// Validate the command, open the connection if needed and attach parameters.
    async fn prepare(
        &self,
        connection: &mut Connection,
        command: &mut Command,
    ) -> DbResult<Ownership> {
        if command.text.trim().is_empty() {
            return Err(DbError::invalid_argument(
                "command_text",
                "command text must not be empty",
            ));
        }

        let ownership = if connection.is_open() {
            Ownership::CallerOwned
        } else {
            connection.open().await?;
            Ownership::OpenedHere
        };

        for parameter in command.parameters.iter_mut() {
            if parameter.direction.is_input() && parameter.value.is_none() {
                parameter.value = Some(Value::Null);
            }
        }
        Ok(ownership)
    }

    async fn run_execute(&self, connection: &mut Connection, command: &mut Command) -> DbResult<u64> {
        let timeout = self.command_timeout(command);
        let bind_by_name = connection.vendor().binds_by_name();
        debug!(
            vendor = %connection.vendor(),
            command_type = ?command.command_type,
            params = command.parameters.len(),
            timeout_secs = timeout,
            "Executing non-query"
        );

        let session = connection.session_mut()?;
        let driver_enforced = session.enforces_timeout();
        let mut prepared = PreparedCommand {
            text: &command.text,
            command_type: command.command_type,
            parameters: &mut command.parameters,
            timeout: Duration::from_secs(timeout as u64),
            bind_by_name,
        };
        let call = session.execute(&mut prepared);
        let result = timed("command execution", timeout, driver_enforced, call).await;
        discard_on_timeout(connection, &result);
        let rows = result?;
        command.finish();
        Ok(rows)
    }

    async fn run_query(
        &self,
        connection: &mut Connection,
        command: &mut Command,
        mode: &'static str,
    ) -> DbResult<Vec<DataTable>> {
        let timeout = self.command_timeout(command);
        let bind_by_name = connection.vendor().binds_by_name();
        debug!(
            vendor = %connection.vendor(),
            command_type = ?command.command_type,
            params = command.parameters.len(),
            timeout_secs = timeout,
            mode,
            "Executing query"
        );

        let session = connection.session_mut()?;
        let driver_enforced = session.enforces_timeout();
        let mut prepared = PreparedCommand {
            text: &command.text,
            command_type: command.command_type,
            parameters: &mut command.parameters,
            timeout: Duration::from_secs(timeout as u64),
            bind_by_name,
        };
        let call = session.query(&mut prepared);
        let result = timed("query execution", timeout, driver_enforced, call).await;
        discard_on_timeout(connection, &result);
        result
    }
}

/// Close the connection if this call opened it, keeping the original error.
async fn release<T>(
    connection: &mut Connection,
    ownership: Ownership,
    result: DbResult<T>,
) -> DbResult<T> {
    if ownership == Ownership::OpenedHere {
        let closed = connection.close().await;
        match (&result, closed) {
            (Ok(_), Err(e)) => return Err(e),
            (Err(_), Err(e)) => warn!(error = %e, "Failed to close connection after error"),
            _ => {}
        }
    }
    result
}

/// Drop the session of a connection whose command timed out.
fn discard_on_timeout<T>(connection: &mut Connection, result: &DbResult<T>) {
    if let Err(DbError::Timeout { operation, .. }) = result {
        if connection.take_session().is_some() {
            warn!(
                vendor = %connection.vendor(),
                operation = %operation,
                "Discarding connection after timeout"
            );
        }
    }
}

/// Apply the command timeout here unless the driver enforces it.
async fn timed<T>(
    operation: &str,
    seconds: u32,
    driver_enforced: bool,
    future: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    if driver_enforced {
        future.await
    } else {
        with_timeout(operation, seconds, future).await
    }
}

async fn with_timeout<T>(
    operation: &str,
    seconds: u32,
    future: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    match tokio::time::timeout(Duration::from_secs(seconds as u64), future).await {
        Ok(result) => result,
        Err(_) => Err(DbError::timeout(operation, seconds)),
    }
}
