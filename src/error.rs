//! Error types for db-helper.
//!
//! Usage errors (bad arguments, wrong vendor, finished transactions) are raised
//! before any I/O. Driver errors are carried verbatim so callers can inspect
//! vendor-specific details; nothing here retries or translates them.

use crate::db::Vendor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid argument '{param}': {message}")]
    InvalidArgument {
        param: &'static str,
        message: String,
    },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("{operation} is not supported on {vendor}")]
    NotSupported { operation: String, vendor: Vendor },

    #[error("Driver not available: {vendor} requires the '{feature}' feature")]
    DriverNotAvailable {
        vendor: Vendor,
        feature: &'static str,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Column not found: {name}")]
    ColumnNotFound { name: String },

    #[error("Cannot read column '{column}' as {expected}: value is {actual}")]
    InvalidCast {
        column: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("No current row: call read() before accessing column values")]
    NoCurrentRow,

    #[error(transparent)]
    Postgres(#[from] sqlx::Error),

    #[cfg(feature = "mssql")]
    #[error(transparent)]
    SqlServer(#[from] tiberius::error::Error),

    #[cfg(feature = "oracle")]
    #[error(transparent)]
    Oracle(#[from] oracle::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Errors raised by driver factories supplied outside this crate.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),
}

impl DbError {
    /// Create an invalid argument error for the named parameter.
    pub fn invalid_argument(param: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            param,
            message: message.into(),
        }
    }

    /// Create an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a not-supported error for an operation on a vendor.
    pub fn not_supported(operation: impl Into<String>, vendor: Vendor) -> Self {
        Self::NotSupported {
            operation: operation.into(),
            vendor,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a column not found error.
    pub fn column_not_found(name: impl Into<String>) -> Self {
        Self::ColumnNotFound { name: name.into() }
    }

    /// Create an invalid cast error.
    pub fn invalid_cast(
        column: impl Into<String>,
        expected: &'static str,
        actual: &'static str,
    ) -> Self {
        Self::InvalidCast {
            column: column.into(),
            expected,
            actual,
        }
    }

    /// Wrap an arbitrary driver error.
    pub fn driver(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Driver(Box::new(err))
    }

    /// True for errors caused by how the API was called rather than by the database.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument { .. }
                | Self::InvalidOperation { .. }
                | Self::NotSupported { .. }
                | Self::DriverNotAvailable { .. }
        )
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
