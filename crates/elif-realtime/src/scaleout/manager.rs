//! Hub lifetime manager spanning several servers through a backplane
//!
//! Each server keeps only its own connections. Fan-out operations publish one
//! message that every server applies to its local targets, so a connection is
//! written exactly once however many servers there are. Operations on a single
//! connection take a local fast path when this server owns it and go through
//! the connection's topic otherwise.

use super::backplane::{Backplane, BackplaneHandler, Subscription};
use super::messages::{
    from_bytes, to_bytes, Ack, ConnectionPayload, FanoutMessage, GroupAction, GroupCommand,
    ReturnMessage, ReturnOutcome,
};
use super::topics::Topics;
use crate::config::RealtimeConfig;
use crate::connection::ConnectionId;
use crate::error::{RealtimeError, RealtimeResult};
use crate::hub::{
    encode, fan_out, ClientResultsManager, CompletionMessage, HubConnectionContext,
    HubLifetimeManager, HubMessage, InvocationIdGenerator, InvocationMessage, MembershipIndex,
};
use async_trait::async_trait;
use axum::body::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a backplane subscription delivers
#[derive(Debug, Clone)]
enum Route {
    All,
    Group(String),
    User(String),
    Connection(ConnectionId),
    GroupManagement,
    Ack,
    Return,
}

/// An invocation this server forwarded to one of its connections for another server
#[derive(Debug, Clone)]
struct RoutedInvocation {
    connection_id: ConnectionId,
    return_server: String,
}

struct Inner<B: Backplane> {
    backplane: Arc<B>,
    topics: Topics,
    server_id: String,
    connections: DashMap<ConnectionId, HubConnectionContext>,
    groups: MembershipIndex,
    users: MembershipIndex,
    results: ClientResultsManager,
    ids: InvocationIdGenerator,
    routed: DashMap<String, RoutedInvocation>,
    /// Per-connection, per-user and per-group subscriptions, keyed by topic
    subscriptions: DashMap<String, Subscription>,
    /// Serializes subscription changes so a topic is subscribed at most once
    subscription_lock: Mutex<()>,
    server_subscriptions: parking_lot::Mutex<Vec<Subscription>>,
    pending_acks: DashMap<u64, oneshot::Sender<()>>,
    ack_counter: AtomicU64,
    ack_timeout: Duration,
}

/// [`HubLifetimeManager`] for one server of a farm sharing a [`Backplane`]
pub struct BackplaneHubLifetimeManager<B: Backplane> {
    inner: Arc<Inner<B>>,
}

impl<B: Backplane> BackplaneHubLifetimeManager<B> {
    /// Create the manager and subscribe to the server-wide topics
    pub async fn new(backplane: Arc<B>, config: &RealtimeConfig) -> RealtimeResult<Self> {
        let server_id = Uuid::new_v4().simple().to_string();
        let inner = Arc::new(Inner {
            backplane,
            topics: Topics::new(config.get_backplane_prefix().clone()),
            ids: InvocationIdGenerator::new(server_id.clone()),
            server_id,
            connections: DashMap::new(),
            groups: MembershipIndex::new(),
            users: MembershipIndex::new(),
            results: ClientResultsManager::new(),
            routed: DashMap::new(),
            subscriptions: DashMap::new(),
            subscription_lock: Mutex::new(()),
            server_subscriptions: parking_lot::Mutex::new(Vec::new()),
            pending_acks: DashMap::new(),
            ack_counter: AtomicU64::new(0),
            ack_timeout: *config.get_group_ack_timeout(),
        });

        let server_topics = [
            (inner.topics.all(), Route::All),
            (inner.topics.group_management(), Route::GroupManagement),
            (inner.topics.ack(&inner.server_id), Route::Ack),
            (inner.topics.return_results(&inner.server_id), Route::Return),
        ];
        let mut subscriptions = Vec::with_capacity(server_topics.len());
        for (topic, route) in server_topics {
            subscriptions.push(inner.subscribe(&topic, route).await?);
        }
        *inner.server_subscriptions.lock() = subscriptions;

        info!("Backplane hub manager {} started", inner.server_id);
        Ok(Self { inner })
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    pub fn local_connection_count(&self) -> usize {
        self.inner.connections.len()
    }
}

impl<B: Backplane> Inner<B> {
    async fn subscribe(self: &Arc<Self>, topic: &str, route: Route) -> RealtimeResult<Subscription> {
        let weak = Arc::downgrade(self);
        let handler: BackplaneHandler = Arc::new(move |payload: Bytes| {
            let weak = weak.clone();
            let route = route.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = inner.handle(route.clone(), payload).await {
                    warn!("Failed to handle backplane message for {:?}: {}", route, err);
                }
            }
            .boxed()
        });
        self.backplane.subscribe(topic, handler).await
    }

    async fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> RealtimeResult<usize> {
        self.backplane.publish(topic, to_bytes(payload)?).await
    }

    fn local(&self, connection_id: &ConnectionId) -> Option<HubConnectionContext> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    fn local_targets(
        &self,
        ids: Vec<ConnectionId>,
        excluded: &[ConnectionId],
    ) -> Vec<HubConnectionContext> {
        ids.into_iter()
            .filter(|id| !excluded.contains(id))
            .filter_map(|id| self.local(&id))
            .collect()
    }

    /// Apply a message from the backplane.
    ///
    /// Boxed so subscription handlers can name its future type.
    fn handle(self: Arc<Self>, route: Route, payload: Bytes) -> BoxFuture<'static, RealtimeResult<()>> {
        async move {
            match route {
                Route::All => {
                    let fanout: FanoutMessage = from_bytes(&payload)?;
                    let ids = self.connections.iter().map(|e| e.key().clone()).collect();
                    let targets = self.local_targets(ids, &fanout.excluded);
                    fan_out(targets, encode(&fanout.message)?).await;
                }
                Route::Group(group) => {
                    let fanout: FanoutMessage = from_bytes(&payload)?;
                    let targets = self.local_targets(self.groups.members(&group), &fanout.excluded);
                    fan_out(targets, encode(&fanout.message)?).await;
                }
                Route::User(user_id) => {
                    let fanout: FanoutMessage = from_bytes(&payload)?;
                    let targets = self.local_targets(self.users.members(&user_id), &fanout.excluded);
                    fan_out(targets, encode(&fanout.message)?).await;
                }
                Route::Connection(connection_id) => {
                    let message: ConnectionPayload = from_bytes(&payload)?;
                    self.deliver_routed(&connection_id, message).await?;
                }
                Route::GroupManagement => {
                    let command: GroupCommand = from_bytes(&payload)?;
                    if self.local(&command.connection_id).is_some() {
                        match command.action {
                            GroupAction::Add => {
                                self.add_local_to_group(&command.connection_id, &command.group)
                                    .await?
                            }
                            GroupAction::Remove => {
                                self.remove_local_from_group(&command.connection_id, &command.group)
                                    .await
                            }
                        }
                        self.publish(&self.topics.ack(&command.server), &Ack { id: command.id })
                            .await?;
                    }
                }
                Route::Ack => {
                    let ack: Ack = from_bytes(&payload)?;
                    if let Some((_, waiter)) = self.pending_acks.remove(&ack.id) {
                        let _ = waiter.send(());
                    }
                }
                Route::Return => {
                    let message: ReturnMessage = from_bytes(&payload)?;
                    match message.outcome {
                        ReturnOutcome::Completed { completion } => {
                            if !self.results.complete(completion) {
                                debug!("Late result for invocation {}", message.invocation_id);
                            }
                        }
                        ReturnOutcome::Disconnected { connection_id } => {
                            self.results.fail(
                                &message.invocation_id,
                                RealtimeError::ConnectionDisconnected { connection_id },
                            );
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Deliver a message addressed to one of this server's connections by another server
    async fn deliver_routed(
        &self,
        connection_id: &ConnectionId,
        payload: ConnectionPayload,
    ) -> RealtimeResult<()> {
        let routed_id = match (&payload.message, &payload.return_server) {
            (
                HubMessage::Invocation(InvocationMessage {
                    invocation_id: Some(id),
                    ..
                }),
                Some(server),
            ) => Some((id.clone(), server.clone())),
            _ => None,
        };

        let Some(connection) = self.local(connection_id) else {
            // Unsubscribed concurrently; tell the caller instead of leaving it waiting
            if let Some((invocation_id, server)) = routed_id {
                self.return_disconnected(&server, invocation_id, connection_id)
                    .await?;
            }
            return Ok(());
        };

        if let Some((invocation_id, server)) = &routed_id {
            self.routed.insert(
                invocation_id.clone(),
                RoutedInvocation {
                    connection_id: connection_id.clone(),
                    return_server: server.clone(),
                },
            );
        }

        if let Err(err) = connection.write(&payload.message).await {
            if let Some((invocation_id, server)) = routed_id {
                self.routed.remove(&invocation_id);
                self.return_disconnected(&server, invocation_id, connection_id)
                    .await?;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn return_disconnected(
        &self,
        server: &str,
        invocation_id: String,
        connection_id: &ConnectionId,
    ) -> RealtimeResult<()> {
        let message = ReturnMessage {
            invocation_id,
            outcome: ReturnOutcome::Disconnected {
                connection_id: connection_id.clone(),
            },
        };
        self.publish(&self.topics.return_results(server), &message)
            .await
            .map(|_| ())
    }

    async fn ensure_subscribed(self: &Arc<Self>, topic: String, route: Route) -> RealtimeResult<()> {
        if !self.subscriptions.contains_key(&topic) {
            let subscription = self.subscribe(&topic, route).await?;
            self.subscriptions.insert(topic, subscription);
        }
        Ok(())
    }

    async fn add_local_to_group(
        self: &Arc<Self>,
        connection_id: &ConnectionId,
        group: &str,
    ) -> RealtimeResult<()> {
        let _guard = self.subscription_lock.lock().await;
        self.groups.add(group, connection_id);
        self.ensure_subscribed(self.topics.group(group), Route::Group(group.to_string()))
            .await
    }

    async fn remove_local_from_group(&self, connection_id: &ConnectionId, group: &str) {
        let _guard = self.subscription_lock.lock().await;
        self.groups.remove(group, connection_id);
        if !self.groups.has_members(group) {
            self.subscriptions.remove(&self.topics.group(group));
        }
    }

    /// Forward a membership change to whichever server owns the connection and wait for its ack
    async fn send_group_command(
        &self,
        connection_id: &ConnectionId,
        group: &str,
        action: GroupAction,
    ) -> RealtimeResult<()> {
        let id = self.ack_counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_acks.insert(id, tx);

        let command = GroupCommand {
            id,
            server: self.server_id.clone(),
            action,
            group: group.to_string(),
            connection_id: connection_id.clone(),
        };
        if let Err(err) = self.publish(&self.topics.group_management(), &command).await {
            self.pending_acks.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.pending_acks.remove(&id);
                Err(RealtimeError::Timeout(format!(
                    "acknowledgement of group change for connection {}",
                    connection_id
                )))
            }
        }
    }

    async fn publish_fanout(
        &self,
        topic: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[ConnectionId],
    ) -> RealtimeResult<()> {
        let message = FanoutMessage {
            excluded: excluded.to_vec(),
            message: HubMessage::invocation(method, args),
        };
        self.publish(topic, &message).await.map(|_| ())
    }
}

#[async_trait]
impl<B: Backplane> HubLifetimeManager for BackplaneHubLifetimeManager<B> {
    async fn on_connected(&self, connection: HubConnectionContext) -> RealtimeResult<()> {
        let inner = &self.inner;
        let _guard = inner.subscription_lock.lock().await;
        let connection_id = connection.connection_id.clone();
        let user_id = connection.user_id.clone();
        inner.connections.insert(connection_id.clone(), connection);

        inner
            .ensure_subscribed(
                inner.topics.connection(&connection_id),
                Route::Connection(connection_id.clone()),
            )
            .await?;

        if let Some(user_id) = user_id {
            inner.users.add(&user_id, &connection_id);
            inner
                .ensure_subscribed(inner.topics.user(&user_id), Route::User(user_id.clone()))
                .await?;
        }

        debug!(
            "Connection {} registered on server {}",
            connection_id, inner.server_id
        );
        Ok(())
    }

    async fn on_disconnected(&self, connection_id: &ConnectionId) -> RealtimeResult<()> {
        let inner = &self.inner;
        {
            let _guard = inner.subscription_lock.lock().await;
            inner.connections.remove(connection_id);
            inner
                .subscriptions
                .remove(&inner.topics.connection(connection_id));
            for group in inner.groups.remove_connection(connection_id) {
                inner.subscriptions.remove(&inner.topics.group(&group));
            }
            for user in inner.users.remove_connection(connection_id) {
                inner.subscriptions.remove(&inner.topics.user(&user));
            }
        }

        inner.results.fail_connection(connection_id);

        let routed: Vec<(String, RoutedInvocation)> = inner
            .routed
            .iter()
            .filter(|entry| entry.connection_id == *connection_id)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (invocation_id, invocation) in routed {
            inner.routed.remove(&invocation_id);
            if let Err(err) = inner
                .return_disconnected(&invocation.return_server, invocation_id, connection_id)
                .await
            {
                warn!("Could not report disconnect of {}: {}", connection_id, err);
            }
        }
        Ok(())
    }

    async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Value>,
        excluded: &[ConnectionId],
    ) -> RealtimeResult<()> {
        self.inner
            .publish_fanout(&self.inner.topics.all(), method, args, excluded)
            .await
    }

    async fn send_connection(
        &self,
        connection_id: &ConnectionId,
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()> {
        let message = HubMessage::invocation(method, args);
        if let Some(connection) = self.inner.local(connection_id) {
            return connection.write(&message).await;
        }

        let payload = ConnectionPayload {
            message,
            return_server: None,
        };
        let reached = self
            .inner
            .publish(&self.inner.topics.connection(connection_id), &payload)
            .await?;
        if reached == 0 {
            debug!("No server owns connection {}", connection_id);
        }
        Ok(())
    }

    async fn send_connections(
        &self,
        connection_ids: &[ConnectionId],
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()> {
        let message = HubMessage::invocation(method, args);
        let mut local = Vec::new();

        for connection_id in connection_ids {
            match self.inner.local(connection_id) {
                Some(connection) => local.push(connection),
                None => {
                    let payload = ConnectionPayload {
                        message: message.clone(),
                        return_server: None,
                    };
                    if let Err(err) = self
                        .inner
                        .publish(&self.inner.topics.connection(connection_id), &payload)
                        .await
                    {
                        warn!("Could not route message to {}: {}", connection_id, err);
                    }
                }
            }
        }

        fan_out(local, encode(&message)?).await;
        Ok(())
    }

    async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[ConnectionId],
    ) -> RealtimeResult<()> {
        self.inner
            .publish_fanout(&self.inner.topics.group(group), method, args, excluded)
            .await
    }

    async fn send_groups(
        &self,
        groups: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()> {
        for group in groups {
            self.inner
                .publish_fanout(&self.inner.topics.group(group), method, args.clone(), &[])
                .await?;
        }
        Ok(())
    }

    async fn send_user(&self, user_id: &str, method: &str, args: Vec<Value>) -> RealtimeResult<()> {
        self.inner
            .publish_fanout(&self.inner.topics.user(user_id), method, args, &[])
            .await
    }

    async fn send_users(
        &self,
        user_ids: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()> {
        for user_id in user_ids {
            self.inner
                .publish_fanout(&self.inner.topics.user(user_id), method, args.clone(), &[])
                .await?;
        }
        Ok(())
    }

    async fn add_to_group(&self, connection_id: &ConnectionId, group: &str) -> RealtimeResult<()> {
        if self.inner.local(connection_id).is_some() {
            return self.inner.add_local_to_group(connection_id, group).await;
        }
        self.inner
            .send_group_command(connection_id, group, GroupAction::Add)
            .await
    }

    async fn remove_from_group(
        &self,
        connection_id: &ConnectionId,
        group: &str,
    ) -> RealtimeResult<()> {
        if self.inner.local(connection_id).is_some() {
            self.inner.remove_local_from_group(connection_id, group).await;
            return Ok(());
        }
        self.inner
            .send_group_command(connection_id, group, GroupAction::Remove)
            .await
    }

    async fn invoke_connection_raw(
        &self,
        connection_id: &ConnectionId,
        method: &str,
        args: Vec<Value>,
        cancellation: CancellationToken,
    ) -> RealtimeResult<Value> {
        let inner = &self.inner;
        let invocation_id = inner.ids.next_id();
        let receiver = inner.results.add_invocation(&invocation_id, connection_id);
        let message = HubMessage::Invocation(InvocationMessage {
            invocation_id: Some(invocation_id.clone()),
            target: method.to_string(),
            arguments: args,
        });

        let sent = match inner.local(connection_id) {
            Some(connection) => connection.write(&message).await,
            None => {
                let payload = ConnectionPayload {
                    message,
                    return_server: Some(inner.server_id.clone()),
                };
                match inner
                    .publish(&inner.topics.connection(connection_id), &payload)
                    .await
                {
                    Ok(0) => Err(RealtimeError::not_found(connection_id.as_str())),
                    Ok(_) => Ok(()),
                    Err(err) => Err(err),
                }
            }
        };

        if let Err(err) = sent {
            inner.results.remove(&invocation_id);
            return Err(err);
        }

        inner
            .results
            .wait(&invocation_id, receiver, cancellation)
            .await
    }

    async fn set_connection_result(
        &self,
        connection_id: &ConnectionId,
        completion: CompletionMessage,
    ) -> RealtimeResult<()> {
        let inner = &self.inner;
        let invocation_id = completion.invocation_id.clone();

        if inner.results.contains(&invocation_id) {
            inner.results.try_complete(connection_id, completion)?;
            return Ok(());
        }

        let Some((_, routed)) = inner.routed.remove(&invocation_id) else {
            warn!(
                "Connection {} completed unknown invocation {}",
                connection_id, invocation_id
            );
            return Ok(());
        };

        if routed.connection_id != *connection_id {
            inner.routed.insert(invocation_id.clone(), routed.clone());
            return Err(RealtimeError::InvalidCompletion(format!(
                "connection {} returned a result for invocation {} sent to {}",
                connection_id, invocation_id, routed.connection_id
            )));
        }

        let message = ReturnMessage {
            invocation_id,
            outcome: ReturnOutcome::Completed { completion },
        };
        inner
            .publish(&inner.topics.return_results(&routed.return_server), &message)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfigBuilder;
    use crate::connection::DuplexChannel;
    use crate::scaleout::MemoryBackplane;

    #[tokio::test]
    async fn test_servers_get_distinct_ids() {
        let config = RealtimeConfigBuilder::testing()
            .build()
            .expect("Failed to build config");
        let backplane = Arc::new(MemoryBackplane::new());
        let a = BackplaneHubLifetimeManager::new(backplane.clone(), &config)
            .await
            .unwrap();
        let b = BackplaneHubLifetimeManager::new(backplane, &config)
            .await
            .unwrap();
        assert_ne!(a.server_id(), b.server_id());
    }

    #[tokio::test]
    async fn test_connection_topic_follows_connection_lifetime() {
        let config = RealtimeConfigBuilder::testing()
            .build()
            .expect("Failed to build config");
        let backplane = Arc::new(MemoryBackplane::new());
        let manager = BackplaneHubLifetimeManager::new(backplane.clone(), &config)
            .await
            .unwrap();
        let channel = DuplexChannel::new(4, 4);
        let id = ConnectionId::from("c1");
        let topic = Topics::new(config.get_backplane_prefix().clone()).connection(&id);

        manager
            .on_connected(HubConnectionContext::new(id.clone(), None, channel.application()))
            .await
            .unwrap();
        assert_eq!(backplane.subscriber_count(&topic), 1);

        manager.on_disconnected(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backplane.subscriber_count(&topic), 0);
        assert_eq!(manager.local_connection_count(), 0);
    }
}
