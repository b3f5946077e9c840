//! One step of a plate's to-do list.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Named argument passed to a device command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name understood by the device
    pub name: String,
    /// Literal value
    pub value: String,
    /// Worklist variable the value was resolved from, if any
    #[serde(default)]
    pub variable: Option<String>,
}

impl Parameter {
    /// Create a literal parameter.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            variable: None,
        }
    }
}

/// A device command a plate must undergo.
///
/// Tasks are immutable once built; `completed` is set when the device reports success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateTask {
    /// Product type of the device that runs the command
    pub device_type: String,
    /// Command name
    pub command: String,
    /// Ordered command parameters
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Set once the device finished the command
    #[serde(default)]
    pub completed: bool,
}

impl PlateTask {
    /// Create a task without parameters.
    pub fn new(device_type: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            command: command.into(),
            parameters: Vec::new(),
            completed: false,
        }
    }

    /// Append a parameter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    /// Value of the first parameter called `name`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// True when this task runs `command` on a device of `device_type`.
    pub fn is(&self, device_type: &str, command: &str) -> bool {
        self.device_type == device_type && self.command == command
    }
}

impl fmt::Display for PlateTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type, self.command)
    }
}
