//! Blocking variant of the facade.
//!
//! Every operation has the same contract as its async counterpart in
//! [`crate::db::DbHelper`] and simply blocks on it. The wrapper owns a
//! current-thread Tokio runtime, so it must not be called from inside an
//! async runtime.

use crate::config::HelperConfig;
use crate::db::connection::{Connection, DbTransaction};
use crate::db::data_reader::DataReader;
use crate::db::driver::{DriverFactory, IsolationLevel};
use crate::db::helper;
use crate::db::Vendor;
use crate::error::DbResult;
use crate::models::{Command, DataSet, DataTable, Value};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

/// Synchronous facade. Parameter factories and configuration are reached
/// through `Deref` to the async [`helper::DbHelper`].
#[derive(Debug)]
pub struct DbHelper {
    inner: helper::DbHelper,
    runtime: Runtime,
}

impl DbHelper {
    pub fn new(vendor: Vendor) -> DbResult<Self> {
        Self::from_async(helper::DbHelper::new(vendor))
    }

    pub fn with_factory(factory: Arc<dyn DriverFactory>) -> DbResult<Self> {
        Self::from_async(helper::DbHelper::with_factory(factory))
    }

    pub fn from_config(config: &HelperConfig) -> DbResult<Self> {
        Self::from_async(helper::DbHelper::from_config(config))
    }

    /// Wrap an async facade, building the runtime that drives it.
    pub fn from_async(inner: helper::DbHelper) -> DbResult<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { inner, runtime })
    }

    /// Release the async facade.
    pub fn into_async(self) -> helper::DbHelper {
        self.inner
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn execute_non_query(&self, connection_string: &str, command: &mut Command) -> DbResult<u64> {
        self.block_on(self.inner.execute_non_query(connection_string, command))
    }

    pub fn execute_non_query_on(&self, connection: &mut Connection, command: &mut Command) -> DbResult<u64> {
        self.block_on(self.inner.execute_non_query_on(connection, command))
    }

    pub fn execute_non_query_in(&self, transaction: &mut DbTransaction, command: &mut Command) -> DbResult<u64> {
        self.block_on(self.inner.execute_non_query_in(transaction, command))
    }

    pub fn execute_dataset(&self, connection_string: &str, command: &mut Command) -> DbResult<DataSet> {
        self.block_on(self.inner.execute_dataset(connection_string, command))
    }

    pub fn execute_dataset_on(&self, connection: &mut Connection, command: &mut Command) -> DbResult<DataSet> {
        self.block_on(self.inner.execute_dataset_on(connection, command))
    }

    pub fn execute_dataset_in(&self, transaction: &mut DbTransaction, command: &mut Command) -> DbResult<DataSet> {
        self.block_on(self.inner.execute_dataset_in(transaction, command))
    }

    pub fn execute_reader(&self, connection_string: &str, command: &mut Command) -> DbResult<DataReader> {
        self.block_on(self.inner.execute_reader(connection_string, command))
    }

    pub fn execute_reader_on(&self, connection: &mut Connection, command: &mut Command) -> DbResult<DataReader> {
        self.block_on(self.inner.execute_reader_on(connection, command))
    }

    pub fn execute_reader_in(&self, transaction: &mut DbTransaction, command: &mut Command) -> DbResult<DataReader> {
        self.block_on(self.inner.execute_reader_in(transaction, command))
    }

    pub fn execute_scalar(&self, connection_string: &str, command: &mut Command) -> DbResult<Value> {
        self.block_on(self.inner.execute_scalar(connection_string, command))
    }

    pub fn execute_scalar_on(&self, connection: &mut Connection, command: &mut Command) -> DbResult<Value> {
        self.block_on(self.inner.execute_scalar_on(connection, command))
    }

    pub fn execute_scalar_in(&self, transaction: &mut DbTransaction, command: &mut Command) -> DbResult<Value> {
        self.block_on(self.inner.execute_scalar_in(transaction, command))
    }

    pub fn begin_transaction(
        &self,
        connection_string: &str,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<DbTransaction> {
        self.block_on(self.inner.begin_transaction(connection_string, isolation))
    }

    pub fn commit(&self, transaction: &mut DbTransaction) -> DbResult<()> {
        self.block_on(transaction.commit())
    }

    pub fn rollback(&self, transaction: &mut DbTransaction) -> DbResult<()> {
        self.block_on(transaction.rollback())
    }

    pub fn bulk_insert(&self, connection_string: &str, table_name: &str, data: &DataTable) -> DbResult<u64> {
        self.block_on(self.inner.bulk_insert(connection_string, table_name, data))
    }

    pub fn open(&self, connection: &mut Connection) -> DbResult<()> {
        self.block_on(connection.open())
    }

    pub fn close(&self, connection: &mut Connection) -> DbResult<()> {
        self.block_on(connection.close())
    }

    /// Close a reader, and its connection if it owns one.
    pub fn close_reader(&self, reader: DataReader) -> DbResult<()> {
        self.block_on(reader.close())
    }
}

impl Deref for DbHelper {
    type Target = helper::DbHelper;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DbHelper {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::models::DbType;

    #[test]
    fn test_configuration_reaches_inner_helper() {
        let mut helper = DbHelper::new(Vendor::Oracle).unwrap();
        assert_eq!(helper.parameter_prefix(), ":");
        helper.set_default_timeout(5);
        assert_eq!(helper.default_timeout(), 5);
        assert_eq!(helper.create_parameter("y", DbType::Int32).name, ":y");
        assert_eq!(helper.into_async().default_timeout(), 5);
    }

    #[test]
    fn test_empty_connection_string_fails_before_io() {
        let helper = DbHelper::new(Vendor::Postgres).unwrap();
        let err = helper
            .execute_scalar("  ", &mut Command::text("SELECT 1"))
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidArgument { param: "connection_string", .. }
        ));
    }

    #[test]
    fn test_bulk_insert_rejected_off_sql_server() {
        let helper = DbHelper::new(Vendor::Oracle).unwrap();
        let err = helper
            .bulk_insert("User Id=a;Password=b;Data Source=c", "t", &DataTable::default())
            .unwrap_err();
        assert!(matches!(err, DbError::NotSupported { .. }));
    }
}
