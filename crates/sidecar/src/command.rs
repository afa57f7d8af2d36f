//! Request and response payloads of the command executor

use direktiv_core::workflow::EnvVar;
use serde::{Deserialize, Serialize};

/// Body of `POST /`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    /// Abort the remaining commands when this one fails
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub suppress_command: bool,
    #[serde(default)]
    pub suppress_output: bool,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_stop(mut self, stop: bool) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push(EnvVar {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn suppressed(mut self, command: bool, output: bool) -> Self {
        self.suppress_command = command;
        self.suppress_output = output;
        self
    }
}

/// Outcome of one attempted command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(rename = "Error")]
    pub error: Option<String>,
    #[serde(rename = "Output")]
    pub output: String,
}
