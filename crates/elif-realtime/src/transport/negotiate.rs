//! Negotiation payload

use crate::connection::{ConnectionId, HttpTransports, TransportType};
use serde::{Deserialize, Serialize};

/// Body of a negotiate response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub connection_id: ConnectionId,
    pub available_transports: Vec<TransportType>,
}

impl NegotiateResponse {
    pub fn new(connection_id: ConnectionId, enabled: HttpTransports) -> Self {
        Self {
            connection_id,
            available_transports: enabled.transports(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_negotiate_payload_shape() {
        let response = NegotiateResponse::new(
            ConnectionId::from("0f3a"),
            HttpTransports::SERVER_SENT_EVENTS | HttpTransports::LONG_POLLING,
        );

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "connectionId": "0f3a",
                "availableTransports": ["ServerSentEvents", "LongPolling"]
            })
        );
    }
}
