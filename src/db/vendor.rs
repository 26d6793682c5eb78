//! Supported database vendors and their per-vendor conventions.

use crate::db::driver::{DriverFactory, UnavailableDriver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Database vendor. Selecting one rewires the driver and the parameter prefix.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    #[default]
    #[value(name = "sqlserver", alias = "mssql")]
    SqlServer,
    #[value(name = "oracle")]
    Oracle,
    #[value(name = "postgres", alias = "postgresql")]
    Postgres,
}

impl Vendor {
    pub const ALL: [Vendor; 3] = [Vendor::SqlServer, Vendor::Oracle, Vendor::Postgres];

    /// Get the display name for this vendor.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::SqlServer => "SQL Server",
            Self::Oracle => "Oracle",
            Self::Postgres => "PostgreSQL",
        }
    }

    /// Prefix every parameter name carries.
    pub fn parameter_prefix(&self) -> &'static str {
        match self {
            Self::Oracle => ":",
            Self::SqlServer | Self::Postgres => "@",
        }
    }

    /// Prepend the vendor prefix unless the name already starts with it.
    pub fn normalize_parameter_name(&self, name: &str) -> String {
        let prefix = self.parameter_prefix();
        if name.starts_with(prefix) {
            name.to_string()
        } else {
            format!("{prefix}{name}")
        }
    }

    /// Whether commands must bind parameters by name instead of position.
    pub fn binds_by_name(&self) -> bool {
        matches!(self, Self::Oracle)
    }

    pub fn supports_bulk_copy(&self) -> bool {
        matches!(self, Self::SqlServer)
    }

    /// Cargo feature that compiles this vendor's driver in.
    pub fn feature_name(&self) -> &'static str {
        match self {
            Self::SqlServer => "mssql",
            Self::Oracle => "oracle",
            Self::Postgres => "default",
        }
    }

    /// The built-in driver factory for this vendor.
    ///
    /// Vendors whose feature is not compiled get a driver that refuses to connect.
    pub fn driver(&self) -> Arc<dyn DriverFactory> {
        match self {
            Self::Postgres => Arc::new(crate::db::drivers::postgres::PostgresDriver),

            #[cfg(feature = "mssql")]
            Self::SqlServer => Arc::new(crate::db::drivers::mssql::SqlServerDriver),

            #[cfg(feature = "oracle")]
            Self::Oracle => Arc::new(crate::db::drivers::oracle::OracleDriver),

            #[allow(unreachable_patterns)]
            other => Arc::new(UnavailableDriver(*other)),
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
