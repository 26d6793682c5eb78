//! Data models for db-helper.
//!
//! This module re-exports all model types used throughout the crate.

pub mod command;
pub mod param;
pub mod table;
pub mod value;

// Re-export commonly used types
pub use command::{Command, CommandType};
pub use param::{
    DbType, OracleDbType, Parameter, ParameterDirection, PgArrayElement, PgDbType, VendorType,
};
pub use table::{DataColumn, DataSet, DataTable};
pub use value::Value;
