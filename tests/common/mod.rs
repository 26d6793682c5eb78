//! In-process driver used by the integration tests.
//!
//! `FakeDriver` records every open, close and command it sees. Queries echo
//! their input parameters back as a single row, so `SELECT @x AS Result`
//! returns the bound value of `@x`.
//!
//! Connection strings steer failures: `unreachable` refuses to connect,
//! `nobegin` fails `BEGIN` and `noclose` fails a graceful close.

#![allow(dead_code)]

use async_trait::async_trait;
use db_helper::db::{DriverFactory, IsolationLevel, PreparedCommand, Session};
use db_helper::error::{DbError, DbResult};
use db_helper::models::{DataTable, Value};
use db_helper::Vendor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Value the fake writes into every output parameter.
pub const OUTPUT_VALUE: i32 = 7;

/// What the fake saw.
#[derive(Debug, Default)]
pub struct Stats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    /// Sessions released by any means, graceful close included.
    pub dropped: AtomicUsize,
    pub events: Mutex<Vec<String>>,
    pub last_timeout: Mutex<Option<Duration>>,
    pub last_bind_by_name: Mutex<Option<bool>>,
    pub last_parameter_names: Mutex<Vec<String>>,
}

impl Stats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

#[derive(Debug, Clone)]
pub struct FakeDriver {
    vendor: Vendor,
    pub stats: Arc<Stats>,
    /// Commands containing `SLOW` sleep this long.
    delay: Duration,
    enforces_timeout: bool,
}

impl FakeDriver {
    pub fn new(vendor: Vendor) -> Self {
        Self {
            vendor,
            stats: Arc::new(Stats::default()),
            delay: Duration::from_secs(5),
            enforces_timeout: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sessions claim to apply command timeouts themselves (they do not).
    pub fn with_driver_timeouts(mut self) -> Self {
        self.enforces_timeout = true;
        self
    }

    pub fn factory(&self) -> Arc<dyn DriverFactory> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl DriverFactory for FakeDriver {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    async fn connect(&self, connection_string: &str) -> DbResult<Box<dyn Session>> {
        if connection_string.contains("unreachable") {
            return Err(DbError::driver(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            stats: Arc::clone(&self.stats),
            delay: self.delay,
            enforces_timeout: self.enforces_timeout,
            fail_begin: connection_string.contains("nobegin"),
            fail_close: connection_string.contains("noclose"),
        }))
    }
}

struct FakeSession {
    stats: Arc<Stats>,
    delay: Duration,
    enforces_timeout: bool,
    fail_begin: bool,
    fail_close: bool,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.stats.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeSession {
    async fn observe(&self, command: &mut PreparedCommand<'_>) -> DbResult<()> {
        *self.stats.last_timeout.lock().unwrap() = Some(command.timeout);
        *self.stats.last_bind_by_name.lock().unwrap() = Some(command.bind_by_name);
        *self.stats.last_parameter_names.lock().unwrap() =
            command.parameters.iter().map(|p| p.name.clone()).collect();
        self.stats.record(format!("command {}", command.text));

        if command.text.contains("SLOW") {
            tokio::time::sleep(self.delay).await;
        }
        if command.text.contains("FAIL") {
            return Err(DbError::driver(std::io::Error::other("syntax error near FAIL")));
        }
        for p in command.parameters.iter_mut() {
            if p.direction.is_output() {
                p.value = Some(Value::Int32(OUTPUT_VALUE));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<u64> {
        self.observe(command).await?;
        Ok(1)
    }

    async fn query(&mut self, command: &mut PreparedCommand<'_>) -> DbResult<Vec<DataTable>> {
        self.observe(command).await?;
        let inputs: Vec<_> = command
            .parameters
            .iter()
            .filter(|p| p.direction.is_input())
            .collect();
        if inputs.is_empty() {
            let mut table = DataTable::with_column_names(["value"]);
            table.push_row(vec![Value::Int32(1)])?;
            return Ok(vec![table]);
        }
        let mut table = DataTable::with_column_names(inputs.iter().map(|p| p.bare_name().to_string()));
        table.push_row(inputs.iter().map(|p| p.value_or_null().clone()).collect())?;
        Ok(vec![table])
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> DbResult<()> {
        self.stats.record(format!("begin {}", isolation.sql_name()));
        if self.fail_begin {
            return Err(DbError::driver(std::io::Error::other("cannot start transaction")));
        }
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.stats.record("commit");
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.stats.record("rollback");
        Ok(())
    }

    async fn bulk_insert(
        &mut self,
        table_name: &str,
        data: &DataTable,
        batch_size: usize,
    ) -> DbResult<u64> {
        self.stats
            .record(format!("bulk {table_name} rows={} batch={batch_size}", data.len()));
        Ok(data.len() as u64)
    }

    fn enforces_timeout(&self) -> bool {
        self.enforces_timeout
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        if self.fail_close {
            return Err(DbError::driver(std::io::Error::other("close failed")));
        }
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
