//! Database abstraction layer.
//!
//! This module provides the execution facade and everything beneath it:
//! - Vendor selection and per-vendor conventions
//! - Connection and transaction lifecycle
//! - The driver seam and the built-in vendor drivers
//! - SQL text tokenizing and placeholder rewriting
//! - Forward-only readers over buffered results
//! - A blocking wrapper around the async facade

pub mod blocking;
pub mod connection;
pub mod data_reader;
pub mod driver;
pub mod drivers;
pub mod helper;
pub(crate) mod sql_text;
pub mod vendor;

pub use connection::{Connection, DbTransaction};
pub use data_reader::DataReader;
pub use driver::{DriverFactory, IsolationLevel, PreparedCommand, Session, UnavailableDriver};
pub use helper::DbHelper;
pub use vendor::Vendor;
