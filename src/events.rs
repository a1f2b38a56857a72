//! Wire events sent to the remote entrypoint and the replies it returns.
//!
//! ```json
//! {"type": "RUN", "code": "...", "index": 0, "data": {...}, "globals": {}, "blobBucket": "b"}
//! {"type": "BUILD", "requirements": ["numpy"], "blobBucket": "b", "blobKey": "builds/..."}
//! ```
//!
//! A RUN reply is `{machine, result}` (optionally `pretty`), a BUILD reply
//! is `{output}`; either may instead be an error envelope
//! `{errorType, errorMessage}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::EncodedValue;

/// Log line prefixes emitted by the platform itself rather than user code.
pub const LIFECYCLE_PREFIXES: [&str; 4] = ["START ", "END ", "REPORT ", "XRAY "];

/// Event payload accepted by the remote entrypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "RUN")]
    Run(RunEvent),
    #[serde(rename = "BUILD")]
    Build(BuildEvent),
}

/// Executes user code against one input slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub code: String,
    /// Zero-based position of this input in the fan-out.
    pub index: usize,
    pub data: EncodedValue,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub globals: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_bucket: Option<String>,
}

/// Installs requirements and uploads the resulting package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEvent {
    pub requirements: Vec<String>,
    pub blob_bucket: String,
    pub blob_key: String,
}

/// Successful RUN reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunReply {
    /// Identifier of the worker that ran the code.
    pub machine: Option<String>,
    pub result: Option<EncodedValue>,
    /// Human-readable rendering, sent when the result is not serializable.
    pub pretty: Option<String>,
}

/// Successful BUILD reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildReply {
    pub output: Option<Value>,
}

/// Structured error raised by the remote code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(rename = "errorType", default = "default_error_type")]
    pub error_type: String,
    #[serde(rename = "errorMessage")]
    pub message: String,
}

fn default_error_type() -> String {
    "Error".to_string()
}

/// Parsed reply payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    /// The payload was JSON `null` or empty.
    Empty,
    Error(RemoteError),
    Ok(T),
}

/// Parses a reply payload into `T` unless it is an error envelope.
///
/// `function_error` is the backend's out-of-band error flag; when it is set
/// but the payload carries no envelope, the raw payload becomes the message.
pub fn parse_reply<T: DeserializeOwned>(
    payload: &[u8],
    function_error: Option<&str>,
) -> Result<Reply<T>, serde_json::Error> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(match function_error {
            Some(kind) => Reply::Error(RemoteError {
                error_type: kind.to_string(),
                message: String::new(),
            }),
            None => Reply::Empty,
        });
    }

    let value: Value = serde_json::from_slice(payload)?;
    if value.get("errorMessage").is_some() {
        return Ok(Reply::Error(serde_json::from_value(value)?));
    }
    if let Some(kind) = function_error {
        return Ok(Reply::Error(RemoteError {
            error_type: kind.to_string(),
            message: value.to_string(),
        }));
    }
    if value.is_null() {
        return Ok(Reply::Empty);
    }
    Ok(Reply::Ok(serde_json::from_value(value)?))
}

/// Returns `true` for platform lifecycle lines.
pub fn is_lifecycle_line(line: &str) -> bool {
    LIFECYCLE_PREFIXES
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// Splits a log tail into the lines worth showing.
///
/// Lifecycle lines are dropped unless `verbose`.
pub fn surface_log_lines(tail: &str, verbose: bool) -> Vec<String> {
    tail.lines()
        .filter(|line| verbose || !is_lifecycle_line(line))
        .map(str::to_string)
        .collect()
}
