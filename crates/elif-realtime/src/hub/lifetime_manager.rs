//! Contract for addressing hub connections

use super::context::HubConnectionContext;
use super::protocol::CompletionMessage;
use crate::connection::ConnectionId;
use crate::error::{RealtimeError, RealtimeResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Tracks hub connections and delivers messages to them.
///
/// Fan-out operations log and skip connections that cannot be written to.
/// Single-target operations report failures to the caller.
#[async_trait]
pub trait HubLifetimeManager: Send + Sync + 'static {
    async fn on_connected(&self, connection: HubConnectionContext) -> RealtimeResult<()>;

    /// Unregister a connection, drop it from every group and fail its pending invocations
    async fn on_disconnected(&self, connection_id: &ConnectionId) -> RealtimeResult<()>;

    async fn send_all(&self, method: &str, args: Vec<Value>) -> RealtimeResult<()> {
        self.send_all_except(method, args, &[]).await
    }

    async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Value>,
        excluded: &[ConnectionId],
    ) -> RealtimeResult<()>;

    async fn send_connection(
        &self,
        connection_id: &ConnectionId,
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()>;

    async fn send_connections(
        &self,
        connection_ids: &[ConnectionId],
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()>;

    async fn send_group(&self, group: &str, method: &str, args: Vec<Value>) -> RealtimeResult<()> {
        self.send_group_except(group, method, args, &[]).await
    }

    async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[ConnectionId],
    ) -> RealtimeResult<()>;

    async fn send_groups(
        &self,
        groups: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()>;

    async fn send_user(&self, user_id: &str, method: &str, args: Vec<Value>) -> RealtimeResult<()>;

    async fn send_users(
        &self,
        user_ids: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()>;

    /// Add a connection to a group. Adding an existing member is a no-op.
    async fn add_to_group(&self, connection_id: &ConnectionId, group: &str) -> RealtimeResult<()>;

    /// Remove a connection from a group. Removing a non-member is a no-op.
    async fn remove_from_group(
        &self,
        connection_id: &ConnectionId,
        group: &str,
    ) -> RealtimeResult<()>;

    /// Invoke a method on a client and wait for its result.
    ///
    /// Fails with [`RealtimeError::ConnectionNotFound`] without sending when
    /// the connection exists nowhere, [`RealtimeError::ConnectionDisconnected`]
    /// when it goes away before answering and
    /// [`RealtimeError::InvocationCanceled`] when `cancellation` fires.
    async fn invoke_connection_raw(
        &self,
        connection_id: &ConnectionId,
        method: &str,
        args: Vec<Value>,
        cancellation: CancellationToken,
    ) -> RealtimeResult<Value>;

    /// Hand a client's completion to whichever caller is waiting for it
    async fn set_connection_result(
        &self,
        connection_id: &ConnectionId,
        completion: CompletionMessage,
    ) -> RealtimeResult<()>;
}

/// Typed helpers over [`HubLifetimeManager`]
pub trait HubLifetimeManagerExt: HubLifetimeManager {
    /// Invoke a client method and deserialize its result into `T`
    fn invoke_connection<'a, T>(
        &'a self,
        connection_id: &'a ConnectionId,
        method: &'a str,
        args: Vec<Value>,
        cancellation: CancellationToken,
    ) -> impl Future<Output = RealtimeResult<T>> + Send + 'a
    where
        T: DeserializeOwned + Send + 'a,
    {
        async move {
            let value = self
                .invoke_connection_raw(connection_id, method, args, cancellation)
                .await?;
            serde_json::from_value(value).map_err(RealtimeError::ResultDeserialization)
        }
    }
}

impl<M: HubLifetimeManager + ?Sized> HubLifetimeManagerExt for M {}
