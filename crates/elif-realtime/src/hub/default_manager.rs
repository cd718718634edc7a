//! Single-process hub lifetime manager

use super::client_results::{ClientResultsManager, InvocationIdGenerator};
use super::context::{fan_out, HubConnectionContext};
use super::lifetime_manager::HubLifetimeManager;
use super::membership::MembershipIndex;
use super::protocol::{encode, CompletionMessage, HubMessage, InvocationMessage};
use crate::connection::ConnectionId;
use crate::error::{RealtimeError, RealtimeResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Keeps every connection in memory; messages never leave this process
pub struct DefaultHubLifetimeManager {
    connections: DashMap<ConnectionId, HubConnectionContext>,
    groups: MembershipIndex,
    users: MembershipIndex,
    results: ClientResultsManager,
    ids: InvocationIdGenerator,
}

impl DefaultHubLifetimeManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            groups: MembershipIndex::new(),
            users: MembershipIndex::new(),
            results: ClientResultsManager::new(),
            ids: InvocationIdGenerator::new(Uuid::new_v4().simple().to_string()),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn contexts<'a, I>(&self, ids: I) -> Vec<HubConnectionContext>
    where
        I: IntoIterator<Item = &'a ConnectionId>,
    {
        ids.into_iter()
            .filter_map(|id| self.connections.get(id).map(|entry| entry.value().clone()))
            .collect()
    }
}

impl Default for DefaultHubLifetimeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HubLifetimeManager for DefaultHubLifetimeManager {
    async fn on_connected(&self, connection: HubConnectionContext) -> RealtimeResult<()> {
        if let Some(user_id) = &connection.user_id {
            self.users.add(user_id, &connection.connection_id);
        }
        debug!("Hub connection {} registered", connection.connection_id);
        self.connections
            .insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn on_disconnected(&self, connection_id: &ConnectionId) -> RealtimeResult<()> {
        self.connections.remove(connection_id);
        self.groups.remove_connection(connection_id);
        self.users.remove_connection(connection_id);
        let failed = self.results.fail_connection(connection_id);
        if failed > 0 {
            debug!(
                "Failed {} pending invocations for disconnected {}",
                failed, connection_id
            );
        }
        Ok(())
    }

    async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Value>,
        excluded: &[ConnectionId],
    ) -> RealtimeResult<()> {
        let payload = encode(&HubMessage::invocation(method, args))?;
        let targets: Vec<_> = self
            .connections
            .iter()
            .filter(|entry| !excluded.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        fan_out(targets, payload).await;
        Ok(())
    }

    async fn send_connection(
        &self,
        connection_id: &ConnectionId,
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()> {
        let Some(connection) = self
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
        else {
            debug!("Dropping message for unknown connection {}", connection_id);
            return Ok(());
        };
        connection.write(&HubMessage::invocation(method, args)).await
    }

    async fn send_connections(
        &self,
        connection_ids: &[ConnectionId],
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()> {
        let payload = encode(&HubMessage::invocation(method, args))?;
        fan_out(self.contexts(connection_ids), payload).await;
        Ok(())
    }

    async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[ConnectionId],
    ) -> RealtimeResult<()> {
        let members: Vec<_> = self
            .groups
            .members(group)
            .into_iter()
            .filter(|id| !excluded.contains(id))
            .collect();
        if members.is_empty() {
            return Ok(());
        }

        let payload = encode(&HubMessage::invocation(method, args))?;
        fan_out(self.contexts(&members), payload).await;
        Ok(())
    }

    async fn send_groups(
        &self,
        groups: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()> {
        // A connection in several of the groups gets one copy
        let members: HashSet<ConnectionId> = groups
            .iter()
            .flat_map(|group| self.groups.members(group))
            .collect();

        let payload = encode(&HubMessage::invocation(method, args))?;
        fan_out(self.contexts(&members), payload).await;
        Ok(())
    }

    async fn send_user(&self, user_id: &str, method: &str, args: Vec<Value>) -> RealtimeResult<()> {
        let payload = encode(&HubMessage::invocation(method, args))?;
        fan_out(self.contexts(&self.users.members(user_id)), payload).await;
        Ok(())
    }

    async fn send_users(
        &self,
        user_ids: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> RealtimeResult<()> {
        let members: HashSet<ConnectionId> = user_ids
            .iter()
            .flat_map(|user| self.users.members(user))
            .collect();

        let payload = encode(&HubMessage::invocation(method, args))?;
        fan_out(self.contexts(&members), payload).await;
        Ok(())
    }

    async fn add_to_group(&self, connection_id: &ConnectionId, group: &str) -> RealtimeResult<()> {
        if !self.connections.contains_key(connection_id) {
            return Err(RealtimeError::not_found(connection_id.as_str()));
        }
        self.groups.add(group, connection_id);
        Ok(())
    }

    async fn remove_from_group(
        &self,
        connection_id: &ConnectionId,
        group: &str,
    ) -> RealtimeResult<()> {
        self.groups.remove(group, connection_id);
        Ok(())
    }

    async fn invoke_connection_raw(
        &self,
        connection_id: &ConnectionId,
        method: &str,
        args: Vec<Value>,
        cancellation: CancellationToken,
    ) -> RealtimeResult<Value> {
        // Registered before the lookup so a concurrent disconnect always sees it
        let invocation_id = self.ids.next_id();
        let receiver = self.results.add_invocation(&invocation_id, connection_id);

        let Some(connection) = self
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
        else {
            self.results.remove(&invocation_id);
            return Err(RealtimeError::not_found(connection_id.as_str()));
        };

        let message = HubMessage::Invocation(InvocationMessage {
            invocation_id: Some(invocation_id.clone()),
            target: method.to_string(),
            arguments: args,
        });
        if let Err(err) = connection.write(&message).await {
            self.results.remove(&invocation_id);
            return Err(err);
        }

        self.results
            .wait(&invocation_id, receiver, cancellation)
            .await
    }

    async fn set_connection_result(
        &self,
        connection_id: &ConnectionId,
        completion: CompletionMessage,
    ) -> RealtimeResult<()> {
        let invocation_id = completion.invocation_id.clone();
        if !self.results.try_complete(connection_id, completion)? {
            warn!(
                "Connection {} completed unknown invocation {}",
                connection_id, invocation_id
            );
        }
        Ok(())
    }
}
