//! Payloads exchanged between servers over the backplane

use crate::connection::ConnectionId;
use crate::error::{RealtimeError, RealtimeResult};
use crate::hub::{CompletionMessage, HubMessage};
use axum::body::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A hub message for every local target of a topic, minus exclusions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<ConnectionId>,
    pub message: HubMessage,
}

/// A hub message for one connection, wherever it lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPayload {
    pub message: HubMessage,
    /// Server waiting on the client's completion, for routed invocations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_server: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupAction {
    Add,
    Remove,
}

/// Ask the owning server to change a connection's group membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCommand {
    pub id: u64,
    pub server: String,
    pub action: GroupAction,
    pub group: String,
    pub connection_id: ConnectionId,
}

/// Acknowledges a [`GroupCommand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub id: u64,
}

/// Outcome of a routed invocation, sent back to the invoking server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReturnOutcome {
    Completed { completion: CompletionMessage },
    #[serde(rename_all = "camelCase")]
    Disconnected { connection_id: ConnectionId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnMessage {
    pub invocation_id: String,
    pub outcome: ReturnOutcome,
}

pub fn to_bytes<T: Serialize>(payload: &T) -> RealtimeResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(payload)?))
}

pub fn from_bytes<T: DeserializeOwned>(payload: &[u8]) -> RealtimeResult<T> {
    serde_json::from_slice(payload)
        .map_err(|err| RealtimeError::backplane(format!("malformed backplane message: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_return_message_shape() {
        let message = ReturnMessage {
            invocation_id: "s1:4".to_string(),
            outcome: ReturnOutcome::Disconnected {
                connection_id: ConnectionId::from("abc"),
            },
        };

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "invocationId": "s1:4",
                "outcome": {"kind": "disconnected", "connectionId": "abc"}
            })
        );
    }

    #[test]
    fn test_malformed_payload_is_backplane_error() {
        let result = from_bytes::<GroupCommand>(b"{}");
        assert!(matches!(result, Err(RealtimeError::Backplane(_))));
    }
}
