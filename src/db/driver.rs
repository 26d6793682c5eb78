//! Driver seam: the traits every vendor backend implements.
//!
//! A [`DriverFactory`] turns a connection string into an open [`Session`].
//! Sessions receive fully prepared commands; parameter normalization, timeouts
//! and connection ownership are handled by the facade before a session sees
//! anything.

use crate::db::Vendor;
use crate::error::{DbError, DbResult};
use crate::models::{CommandType, DataTable, Parameter};
use async_trait::async_trait;
use std::time::Duration;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    /// SQL Server only.
    Snapshot,
}

impl IsolationLevel {
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

/// A command ready for a session: parameters are attached and normalized.
///
/// Sessions write output parameter values back into `parameters`.
#[derive(Debug)]
pub struct PreparedCommand<'a> {
    pub text: &'a str,
    pub command_type: CommandType,
    pub parameters: &'a mut [Parameter],
    pub timeout: Duration,
    /// Bind by parameter name rather than by position.
    pub bind_by_name: bool,
}

/// Creates sessions for one vendor.
#[async_trait]
pub trait DriverFactory: Send + Sync + std::fmt::Debug {
    fn vendor(&self) -> Vendor;

    /// Open a new session. The connection string is passed through unmodified.
    async fn connect(&self, connection_string: &str) -> DbResult<Box<dyn Session>>;
}

/// An open driver connection.
#[async_trait]
pub trait Session: Send {
    /// Execute a command and return the affected row count.
    async fn execute(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<u64>;

    /// Execute a command and materialize every result set it produces.
    async fn query(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<Vec<DataTable>>;

    async fn begin(&mut self, isolation: IsolationLevel) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Stream rows into `table_name`, committing every `batch_size` rows.
    async fn bulk_insert(
        &mut self,
        table_name: &str,
        data: &DataTable,
        batch_size: usize,
    ) -> DbResult<u64> {
        let _ = (table_name, data, batch_size);
        Err(DbError::invalid_operation(
            "this driver does not implement bulk insert",
        ))
    }

    /// True if the driver applies `PreparedCommand::timeout` itself and reports
    /// expiry as [`DbError::Timeout`]. The facade then awaits the command
    /// instead of abandoning it at the deadline.
    fn enforces_timeout(&self) -> bool {
        false
    }

    /// Close the session gracefully.
    async fn close(self: Box<Self>) -> DbResult<()>;
}

/// Factory for vendors whose driver was not compiled in.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableDriver(pub Vendor);

#[async_trait]
impl DriverFactory for UnavailableDriver {
    fn vendor(&self) -> Vendor {
        self.0
    }

    async fn connect(&self, _connection_string: &str) -> DbResult<Box<dyn Session>> {
        Err(DbError::DriverNotAvailable {
            vendor: self.0,
            feature: self.0.feature_name(),
        })
    }
}
