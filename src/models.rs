//! Data models shared between the runner and the worker process.
//!
//! `Command` and `Response` are what callers see. `WireRequest` and
//! `WireResponse` are the JSON bodies carried inside each framed message.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A request for the worker process.
///
/// Opaque to the bridge: it is handed to the channel as-is and never
/// inspected after submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name understood by the worker (e.g. `"PING"`).
    pub name: String,
    /// Command arguments.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl Command {
    /// Create a command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: serde_json::Map::new(),
        }
    }

    /// Add an argument, replacing any previous value under the same key.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Parse a command from a line of input.
    ///
    /// A line starting with `{` is decoded as a JSON `Command`; anything
    /// else is taken as a bare command name.
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            serde_json::from_str(trimmed)
        } else {
            Ok(Self::new(trimmed))
        }
    }
}

/// Outcome of a single command, as reported by the channel.
///
/// Every variant other than `Success` is a transport failure. They are all
/// logged identically and only distinguished for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The worker executed the command and returned a payload.
    Success(String),
    /// The channel was already closed when the command was sent.
    AlreadyClosed,
    /// The connection failed while the command was in flight.
    ConnectionFailure,
    /// The command could not be encoded.
    MalformedRequest,
    /// The worker's reply could not be decoded.
    MalformedResponse,
    /// The worker reported an error while executing the command.
    ServerError,
    /// The worker gave up on the command after the given number of seconds.
    Timeout(u64),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Success(payload) => write!(f, "success ({} bytes)", payload.len()),
            Response::AlreadyClosed => f.write_str("already closed sockets"),
            Response::ConnectionFailure => f.write_str("connection failure"),
            Response::MalformedRequest => f.write_str("malformed request"),
            Response::MalformedResponse => f.write_str("malformed response"),
            Response::ServerError => f.write_str("server error"),
            Response::Timeout(secs) => write!(f, "command timeout after {}s", secs),
        }
    }
}

/// Message body sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireRequest {
    /// Execute a command and reply with a `WireResponse` carrying the same id.
    Command { id: u64, command: Command },
    /// The runner is done; the worker should close the connection.
    Done,
}

/// Status reported by the worker in a `WireResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    Ok,
    Error,
    Timeout,
}

/// Message body received from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    /// Id of the request this answers.
    #[serde(default)]
    pub id: Option<u64>,
    pub status: WireStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Error detail from the worker, for logging only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Seconds the worker waited before giving up (`status == timeout`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl WireResponse {
    /// Successful reply carrying `payload`.
    pub fn ok(id: u64, payload: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            status: WireStatus::Ok,
            payload: Some(payload.into()),
            message: None,
            timeout_secs: None,
        }
    }

    /// Error reply with a diagnostic message.
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            status: WireStatus::Error,
            payload: None,
            message: Some(message.into()),
            timeout_secs: None,
        }
    }

    /// Map the wire status onto a `Response`.
    ///
    /// An `ok` reply without a payload is a success with an empty payload.
    pub fn into_response(self) -> Response {
        match self.status {
            WireStatus::Ok => Response::Success(self.payload.unwrap_or_default()),
            WireStatus::Error => Response::ServerError,
            WireStatus::Timeout => Response::Timeout(self.timeout_secs.unwrap_or(0)),
        }
    }
}
