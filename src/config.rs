//! Configuration handling for db-helper.
//!
//! `HelperConfig` is the serializable library configuration a `DbHelper` is
//! built from. `Config` is the command-line surface of the `db-helper` binary,
//! parsed with clap from arguments and environment variables.

use crate::db::Vendor;
use crate::models::{CommandType, Value};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u32 = 30;

/// Rows per bulk-copy batch.
pub const BULK_COPY_BATCH_SIZE: usize = 1000;

/// Library configuration for one facade instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperConfig {
    #[serde(default)]
    pub vendor: Vendor,
    /// Default command timeout in seconds. Non-positive values fall back to the default.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: i64,
}

fn default_timeout_secs() -> i64 {
    DEFAULT_COMMAND_TIMEOUT_SECS as i64
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            vendor: Vendor::default(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

/// What the binary does with the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExecuteMode {
    /// Print the affected row count
    NonQuery,
    /// Print the first column of the first row
    #[default]
    Scalar,
    /// Print every result set
    Dataset,
    /// Stream rows of the first result set as JSON lines
    Reader,
}

impl std::fmt::Display for ExecuteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonQuery => write!(f, "non-query"),
            Self::Scalar => write!(f, "scalar"),
            Self::Dataset => write!(f, "dataset"),
            Self::Reader => write!(f, "reader"),
        }
    }
}

/// A `name=value` command-line parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamArg {
    pub name: String,
    pub value: Value,
}

impl std::str::FromStr for ParamArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s
            .split_once('=')
            .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("parameter name is empty in '{s}'"));
        }
        Ok(Self {
            name: name.to_string(),
            value: Value::parse_literal(value),
        })
    }
}

/// Command-line configuration for the db-helper binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-helper",
    about = "Run one command against SQL Server, Oracle or PostgreSQL through a vendor-neutral facade",
    version,
    author
)]
pub struct Config {
    /// SQL text, or the procedure name with --procedure
    #[arg(value_name = "COMMAND")]
    pub command_text: String,

    /// Database vendor
    #[arg(short, long, value_enum, default_value = "sqlserver", env = "DB_HELPER_VENDOR")]
    pub vendor: Vendor,

    /// Connection string passed to the driver unmodified
    #[arg(
        short = 'c',
        long = "connection-string",
        env = "DB_HELPER_CONNECTION_STRING",
        hide_env_values = true
    )]
    pub connection_string: String,

    /// Execution mode
    #[arg(short, long, value_enum, default_value_t = ExecuteMode::Scalar)]
    pub mode: ExecuteMode,

    /// Treat COMMAND as a stored procedure name
    #[arg(long)]
    pub procedure: bool,

    /// Parameter as name=value; may be repeated
    #[arg(short, long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<ParamArg>,

    /// Command timeout in seconds
    #[arg(
        short,
        long,
        default_value_t = DEFAULT_COMMAND_TIMEOUT_SECS as i64,
        env = "DB_HELPER_TIMEOUT"
    )]
    pub timeout: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "RUST_LOG")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

impl Config {
    pub fn command_type(&self) -> CommandType {
        if self.procedure {
            CommandType::StoredProcedure
        } else {
            CommandType::Text
        }
    }

    pub fn helper_config(&self) -> HelperConfig {
        HelperConfig {
            vendor: self.vendor,
            default_timeout_secs: self.timeout,
        }
    }
}
