//! Hub-level view of a connection

use super::protocol::{encode, HubMessage};
use crate::connection::{ConnectionId, DuplexSide};
use crate::error::{RealtimeError, RealtimeResult};
use axum::body::Bytes;
use futures::future::join_all;
use tracing::warn;

/// A connection as seen by a hub lifetime manager
#[derive(Debug, Clone)]
pub struct HubConnectionContext {
    pub connection_id: ConnectionId,
    pub user_id: Option<String>,
    channel: DuplexSide,
}

impl HubConnectionContext {
    pub fn new(connection_id: ConnectionId, user_id: Option<String>, channel: DuplexSide) -> Self {
        Self {
            connection_id,
            user_id,
            channel,
        }
    }

    pub async fn write(&self, message: &HubMessage) -> RealtimeResult<()> {
        self.write_encoded(encode(message)?).await
    }

    /// Write an already encoded message
    pub async fn write_encoded(&self, payload: Bytes) -> RealtimeResult<()> {
        self.channel
            .write(payload)
            .await
            .map_err(|err| RealtimeError::transport_write(&self.connection_id, err.to_string()))
    }
}

/// Write one payload to many connections concurrently.
///
/// Individual failures are logged and skipped.
pub async fn fan_out<I>(targets: I, payload: Bytes)
where
    I: IntoIterator<Item = HubConnectionContext>,
{
    let writes = targets.into_iter().map(|target| {
        let payload = payload.clone();
        async move {
            if let Err(err) = target.write_encoded(payload).await {
                warn!("Dropping message for {}: {}", target.connection_id, err);
            }
        }
    });
    join_all(writes).await;
}
