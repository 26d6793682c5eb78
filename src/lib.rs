//! db-helper library
//!
//! A vendor-neutral facade for running commands against SQL Server, Oracle and
//! PostgreSQL, plus a row reader that caches column ordinals across rows and
//! across readers of the same query shape.
//!
//! ```no_run
//! use db_helper::{Command, DbHelper, Vendor};
//!
//! # async fn run() -> db_helper::error::DbResult<()> {
//! let helper = DbHelper::new(Vendor::Postgres);
//! let mut command = Command::text("SELECT @x AS result")
//!     .param(helper.create_parameter_with_value("x", 42i32));
//! let value = helper
//!     .execute_scalar("postgres://localhost/app", &mut command)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod reader;

pub use config::{Config, HelperConfig};
pub use db::{Connection, DataReader, DbHelper, DbTransaction, IsolationLevel, Vendor};
pub use error::{DbError, DbResult};
pub use models::{
    Command, CommandType, DataSet, DataTable, DbType, Parameter, ParameterDirection, Value,
};
pub use reader::{OrdinalCache, RowCursor, RowReader};
