//! Command descriptors.

use crate::models::{Parameter, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the driver interprets the command text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Literal SQL.
    #[default]
    Text,
    /// Name of a stored routine.
    StoredProcedure,
}

/// A command to execute: text, kind, ordered parameters and an optional
/// timeout override.
///
/// After a non-query, dataset or scalar execution the parameter list is
/// cleared; values written back by the server for output parameters stay
/// available through [`Command::output`].
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub text: String,
    pub command_type: CommandType,
    pub parameters: Vec<Parameter>,
    timeout: Option<u32>,
    outputs: HashMap<String, Value>,
}

impl Command {
    pub fn new(command_type: CommandType, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            command_type,
            ..Self::default()
        }
    }

    /// A literal SQL command.
    pub fn text(sql: impl Into<String>) -> Self {
        Self::new(CommandType::Text, sql)
    }

    /// A stored procedure call.
    pub fn procedure(name: impl Into<String>) -> Self {
        Self::new(CommandType::StoredProcedure, name)
    }

    /// Append a parameter. Binding order is insertion order.
    pub fn param(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn params(mut self, parameters: impl IntoIterator<Item = Parameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    /// Builder form of [`Command::set_timeout`].
    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.set_timeout(seconds);
        self
    }

    /// Override the command timeout for this call. Zero is ignored.
    pub fn set_timeout(&mut self, seconds: u32) {
        if seconds > 0 {
            self.timeout = Some(seconds);
        }
    }

    /// Drop the override so the facade default applies again.
    pub fn reset_timeout(&mut self) {
        self.timeout = None;
    }

    pub fn timeout_override(&self) -> Option<u32> {
        self.timeout
    }

    /// Value written back for an output parameter, by name with or without prefix.
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name.trim_start_matches([':', '@']))
    }

    /// Capture output values and detach the parameter list.
    pub(crate) fn finish(&mut self) {
        for p in self.parameters.drain(..) {
            if p.direction.is_output() {
                let bare = p.bare_name().to_string();
                self.outputs.insert(bare, p.value.unwrap_or(Value::Null));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParameterDirection;

    #[test]
    fn test_timeout_override() {
        let mut cmd = Command::text("SELECT 1");
        assert_eq!(cmd.timeout_override(), None);
        cmd.set_timeout(0);
        assert_eq!(cmd.timeout_override(), None);
        cmd.set_timeout(90);
        assert_eq!(cmd.timeout_override(), Some(90));
        cmd.reset_timeout();
        assert_eq!(cmd.timeout_override(), None);
    }

    #[test]
    fn test_finish_keeps_outputs_and_clears_parameters() {
        let mut cmd = Command::procedure("get_total")
            .param(Parameter::new("@id").with_value(1i32))
            .param(
                Parameter::new("@total")
                    .with_direction(ParameterDirection::Output)
                    .with_value(99i64),
            );
        cmd.finish();
        assert!(cmd.parameters.is_empty());
        assert_eq!(cmd.output("@total"), Some(&Value::Int64(99)));
        assert_eq!(cmd.output("total"), Some(&Value::Int64(99)));
        assert_eq!(cmd.output("id"), None);
    }
}
