//! Application callbacks attached to connections

use super::connection::{spawn_shared, Connection, SharedTask};
use super::pipe::DuplexSide;
use super::types::ConnectionId;
use crate::error::RealtimeResult;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the application sees of a connection
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub user_id: Option<String>,
    pub items: HashMap<String, String>,
    channel: DuplexSide,
}

impl ConnectionContext {
    pub fn new(
        connection_id: ConnectionId,
        user_id: Option<String>,
        items: HashMap<String, String>,
        channel: DuplexSide,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            items,
            channel,
        }
    }

    /// Next message from the client, `None` once the client side is finished
    pub async fn read(&self) -> Option<Bytes> {
        self.channel.read().await
    }

    /// Queue a message for the client, waiting while the outbound buffer is full
    pub async fn write(&self, data: impl Into<Bytes>) -> RealtimeResult<()> {
        self.channel.write(data).await
    }

    /// The raw duplex side, for handlers that split reading and writing
    pub fn channel(&self) -> &DuplexSide {
        &self.channel
    }
}

/// Long-running application callback for a connection.
///
/// Runs once per connection, across every long poll. Returning ends the
/// connection: the transport flushes what was written and closes.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn on_connected(&self, context: ConnectionContext) -> RealtimeResult<()>;
}

/// Derives the user identifier for a connection from its connect request
pub trait UserIdProvider: Send + Sync + 'static {
    fn user_id(&self, headers: &HeaderMap) -> Option<String>;
}

/// Reads the user id from a request header
#[derive(Debug, Clone)]
pub struct HeaderUserIdProvider {
    header: String,
}

impl HeaderUserIdProvider {
    pub fn new<T: Into<String>>(header: T) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for HeaderUserIdProvider {
    fn default() -> Self {
        Self::new("x-user-id")
    }
}

impl UserIdProvider for HeaderUserIdProvider {
    fn user_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.header.as_str())
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

/// Start the application task for a connection.
///
/// When the handler returns, the outbound pipe is completed so the transport
/// can drain it and end the session.
pub fn start_application(
    handler: Arc<dyn ConnectionHandler>,
    connection: &Connection,
) -> SharedTask<()> {
    let metadata = connection.metadata();
    let context = ConnectionContext::new(
        connection.id().clone(),
        metadata.user_id,
        metadata.items,
        connection.application(),
    );
    let outbound = connection.channel().outbound.clone();
    let connection_id = connection.id().clone();

    spawn_shared(async move {
        let result = handler.on_connected(context).await;
        outbound.complete();
        match &result {
            Ok(()) => debug!("Application for connection {} finished", connection_id),
            Err(err) => warn!(
                "Application for connection {} failed: {}",
                connection_id, err
            ),
        }
        result
    })
}
