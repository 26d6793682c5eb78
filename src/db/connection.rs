//! Connections and transactions handed out by the facade.

use crate::db::driver::{DriverFactory, IsolationLevel, Session};
use crate::db::Vendor;
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A database connection that may or may not be open.
///
/// Opening creates a driver session; closing drops it gracefully. Calling
/// `close` on a closed connection is a no-op.
pub struct Connection {
    /// Sensitive - never log
    connection_string: String,
    factory: Arc<dyn DriverFactory>,
    session: Option<Box<dyn Session>>,
}

impl Connection {
    /// Create a closed connection. Fails on an empty connection string.
    pub fn new(factory: Arc<dyn DriverFactory>, connection_string: impl Into<String>) -> DbResult<Self> {
        let connection_string = connection_string.into();
        if connection_string.trim().is_empty() {
            return Err(DbError::invalid_argument(
                "connection_string",
                "connection string must not be empty",
            ));
        }
        Ok(Self {
            connection_string,
            factory,
            session: None,
        })
    }

    pub fn vendor(&self) -> Vendor {
        self.factory.vendor()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Open the connection. Opening an already open connection is a no-op.
    pub async fn open(&mut self) -> DbResult<()> {
        if self.session.is_none() {
            debug!(vendor = %self.vendor(), "Opening connection");
            self.session = Some(self.factory.connect(&self.connection_string).await?);
        }
        Ok(())
    }

    /// Close the connection.
    pub async fn close(&mut self) -> DbResult<()> {
        match self.session.take() {
            Some(session) => {
                debug!(vendor = %self.vendor(), "Closing connection");
                session.close().await
            }
            None => Ok(()),
        }
    }

    pub(crate) fn session_mut(&mut self) -> DbResult<&mut (dyn Session + 'static)> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| DbError::invalid_operation("connection is not open"))
    }

    /// Move the open session out, leaving this connection closed.
    pub(crate) fn take_session(&mut self) -> Option<Box<dyn Session>> {
        self.session.take()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("vendor", &self.vendor())
            .field("open", &self.is_open())
            .finish()
    }
}

/// A transaction bound to a connection the facade opened for it.
///
/// Commit and rollback both close the connection. A finished transaction
/// rejects further commands. Dropping an unfinished transaction drops the
/// session, which aborts the transaction on the server.
#[derive(Debug)]
pub struct DbTransaction {
    connection: Connection,
    isolation: IsolationLevel,
    completed: bool,
}

impl DbTransaction {
    /// Open `connection` and start a transaction on it.
    pub(crate) async fn begin(
        mut connection: Connection,
        isolation: IsolationLevel,
    ) -> DbResult<Self> {
        connection.open().await?;
        if let Err(e) = connection.session_mut()?.begin(isolation).await {
            if let Err(close_err) = connection.close().await {
                warn!(error = %close_err, "Failed to close connection after failed begin");
            }
            return Err(e);
        }
        info!(
            vendor = %connection.vendor(),
            isolation = isolation.sql_name(),
            "Transaction started"
        );
        Ok(Self {
            connection,
            isolation,
            completed: false,
        })
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    /// True until committed or rolled back, and while the connection is open.
    pub fn is_active(&self) -> bool {
        !self.completed && self.connection.is_open()
    }

    pub fn vendor(&self) -> Vendor {
        self.connection.vendor()
    }

    /// Connection for commands enlisted in this transaction.
    pub(crate) fn connection_for_command(&mut self) -> DbResult<&mut Connection> {
        if !self.is_active() {
            return Err(DbError::invalid_argument(
                "transaction",
                "transaction was rolled back or committed, it is no longer usable",
            ));
        }
        Ok(&mut self.connection)
    }

    /// Commit, then close the connection.
    pub async fn commit(&mut self) -> DbResult<()> {
        let result = self.connection_for_command()?.session_mut()?.commit().await;
        self.finish(result, "committed").await
    }

    /// Roll back, then close the connection.
    pub async fn rollback(&mut self) -> DbResult<()> {
        let result = self.connection_for_command()?.session_mut()?.rollback().await;
        self.finish(result, "rolled back").await
    }

    async fn finish(&mut self, result: DbResult<()>, outcome: &str) -> DbResult<()> {
        self.completed = true;
        let closed = self.connection.close().await;
        result?;
        info!(vendor = %self.vendor(), outcome, "Transaction finished");
        closed
    }
}
