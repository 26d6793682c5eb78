//! Built-in vendor drivers.
//!
//! Each submodule adapts one client library to the [`Session`] seam:
//! - `postgres`: sqlx, always compiled
//! - `mssql`: tiberius over a tokio TCP stream (feature `mssql`)
//! - `oracle`: ODPI-C through the `oracle` crate, run on the blocking pool (feature `oracle`)
//!
//! [`Session`]: crate::db::driver::Session

pub mod postgres;

#[cfg(feature = "mssql")]
pub mod mssql;

#[cfg(feature = "oracle")]
pub mod oracle;

use crate::models::{DataTable, Parameter};

/// Copy values of output parameters from the first row of `table`, matched by
/// column name. Used by drivers whose routines return outputs as a row.
pub(crate) fn fill_outputs_from_row(parameters: &mut [Parameter], table: Option<&DataTable>) {
    let Some(table) = table else {
        return;
    };
    let Some(values) = table.rows.first() else {
        return;
    };
    for parameter in parameters.iter_mut().filter(|p| p.direction.is_output()) {
        if let Some(ordinal) = table.ordinal(parameter.bare_name()) {
            parameter.value = values.get(ordinal).cloned();
        }
    }
}
