//! Hub message framing
//!
//! Messages are JSON objects tagged by `type`, each terminated by the ASCII
//! record separator so several can share one transport frame.

use crate::error::{RealtimeError, RealtimeResult};
use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminates every encoded message
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// A call from one side to a method on the other
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMessage {
    /// Present when the caller expects a completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// The outcome of an invocation that carried an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionMessage {
    pub fn with_result<T: Into<String>>(invocation_id: T, result: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn with_error<T: Into<String>, E: Into<String>>(invocation_id: T, error: E) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// The result value, or the remote error message verbatim
    pub fn into_result(self) -> RealtimeResult<Value> {
        match self.error {
            Some(error) => Err(RealtimeError::InvocationFailed(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubMessage {
    Invocation(InvocationMessage),
    Completion(CompletionMessage),
    Ping,
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl HubMessage {
    pub fn invocation<T: Into<String>>(target: T, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation(InvocationMessage {
            invocation_id: None,
            target: target.into(),
            arguments,
        })
    }
}

/// Encode one message with its trailing separator
pub fn encode(message: &HubMessage) -> RealtimeResult<Bytes> {
    let mut buffer = serde_json::to_vec(message)?;
    buffer.push(RECORD_SEPARATOR);
    Ok(Bytes::from(buffer))
}

/// Decode every message in a frame
pub fn decode(frame: &[u8]) -> RealtimeResult<Vec<HubMessage>> {
    frame
        .split(|byte| *byte == RECORD_SEPARATOR)
        .filter(|record| !record.iter().all(u8::is_ascii_whitespace))
        .map(|record| {
            serde_json::from_slice(record)
                .map_err(|err| RealtimeError::protocol(format!("invalid hub message: {}", err)))
        })
        .collect()
}
