use std::fmt;
use std::net::SocketAddr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use super::dispatcher::DispatchError;
use super::dispatcher::Outcome;

/// Where a command request came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Broker { topic: String },
    Rest { peer: Option<SocketAddr> },
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Broker { topic } => write!(f, "mqtt ({})", topic),
            Origin::Rest { peer: Some(peer) } => write!(f, "rest ({})", peer),
            Origin::Rest { peer: None } => write!(f, "rest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command: String,
    pub args: Map<String, Value>,
    pub origin: Origin,
}

/// Wire form of a run request: `{"command": "...", "args": {...}}`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunRequest {
    pub command: String,

    #[serde(default)]
    pub args: Option<Map<String, Value>>,
}

impl RunRequest {
    pub fn into_request(self, origin: Origin) -> CommandRequest {
        CommandRequest {
            command: self.command,
            args: self.args.unwrap_or_default(),
            origin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Result document published on `run_result` and returned by `POST /run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: ResultStatus,
    pub message: String,
}

impl CommandResult {
    pub fn success(message: String) -> Self {
        Self {
            status: ResultStatus::Success,
            message,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            status: ResultStatus::Error,
            message,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing two plain fields cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

impl From<&Result<Outcome, DispatchError>> for CommandResult {
    fn from(result: &Result<Outcome, DispatchError>) -> Self {
        match result {
            Ok(Outcome::Accepted) => CommandResult::success("command started".to_string()),
            Ok(Outcome::Completed { output, .. }) if output.is_empty() => {
                CommandResult::success("command completed".to_string())
            }
            Ok(Outcome::Completed { output, .. }) => CommandResult::success(output.clone()),
            Err(e) => CommandResult::error(e.to_string()),
        }
    }
}
