//! Connection registry and heartbeat reaper

use super::connection::Connection;
use super::pipe::DuplexChannel;
use super::types::{ConnectionId, ConnectionStatus};
use crate::config::RealtimeConfig;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::{join_all, FutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle events published by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Created(ConnectionId),
    Removed(ConnectionId),
}

/// Connection counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub inactive_connections: usize,
    pub active_connections: usize,
    pub disposed_connections: usize,
}

/// Owns every live connection of this server
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    config: RealtimeConfig,
    /// Held for the duration of a scan; a tick that cannot take it is skipped
    scan_lock: Mutex<()>,
    events: broadcast::Sender<RegistryEvent>,
    heartbeat: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ConnectionRegistry {
    pub fn new(config: RealtimeConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            connections: DashMap::new(),
            config,
            scan_lock: Mutex::new(()),
            events,
            heartbeat: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Create and register a new inactive connection with its duplex channel
    pub fn create_connection(&self) -> Arc<Connection> {
        let id = ConnectionId::new();
        let channel = DuplexChannel::new(
            *self.config.get_application_max_buffer(),
            *self.config.get_transport_max_buffer(),
        );
        let connection = Arc::new(Connection::new(id.clone(), channel));
        self.connections.insert(id.clone(), connection.clone());

        debug!("Created connection {}", id);
        let _ = self.events.send(RegistryEvent::Created(id));
        connection
    }

    pub fn try_get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Unregister a connection. Removing an unknown id does nothing.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(id).map(|(_, connection)| connection);
        if removed.is_some() {
            debug!("Removed connection {}", id);
            let _ = self.events.send(RegistryEvent::Removed(id.clone()));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Observe connection creation and removal. Dropping the receiver unsubscribes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Dispose a connection and unregister it.
    ///
    /// Transport resets are logged as warnings and other failures as errors;
    /// the connection is removed from the registry either way.
    pub async fn dispose_and_remove(&self, connection: Arc<Connection>) {
        let result = AssertUnwindSafe(connection.dispose(*self.config.get_websocket_close_timeout()))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_transport_reset() => {
                warn!("Connection {} was reset by the client: {}", connection.id(), err)
            }
            Ok(Err(err)) => error!("Failed disposing connection {}: {}", connection.id(), err),
            Err(_) => error!("Disposing connection {} panicked", connection.id()),
        }

        self.remove(connection.id());
    }

    /// One heartbeat pass over every connection.
    ///
    /// Returns how many idle connections were scheduled for disposal, or `None`
    /// when another scan was already running.
    pub async fn scan(self: &Arc<Self>) -> Option<usize> {
        let Ok(_guard) = self.scan_lock.try_lock() else {
            debug!("Heartbeat scan already running, skipping tick");
            return None;
        };

        let now = Utc::now();
        let mut reaped = 0;

        for connection in self.snapshot() {
            let (status, last_seen) = connection.snapshot().await;
            let idle = (now - last_seen).to_std().unwrap_or_default();

            if status == ConnectionStatus::Inactive
                && idle > *self.config.get_inactive_timeout()
                && *self.config.get_reaping_enabled()
            {
                debug!(
                    "Connection {} idle for {:?}, disposing",
                    connection.id(),
                    idle
                );
                reaped += 1;
                let registry = self.clone();
                tokio::spawn(async move { registry.dispose_and_remove(connection).await });
            } else {
                connection.tick_heartbeat();
            }
        }

        Some(reaped)
    }

    /// Start the background heartbeat loop. Calling it again while running does nothing.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *heartbeat = Some(token.clone());

        let registry: Weak<Self> = Arc::downgrade(self);
        let period = *self.config.get_heartbeat_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        // Awaited inline so the next tick waits for this scan
                        registry.scan().await;
                    }
                }
            }

            debug!("Heartbeat loop stopped");
        });

        info!("Heartbeat started with interval {:?}", period);
    }

    pub fn stop_heartbeat(&self) {
        if let Some(token) = self.heartbeat.lock().take() {
            token.cancel();
        }
    }

    /// Dispose every connection, bounded by the shutdown grace period.
    ///
    /// Connections still disposing when the grace period ends are abandoned.
    pub async fn close_all(&self) {
        self.stop_heartbeat();

        let connections = self.snapshot();
        if connections.is_empty() {
            return;
        }

        info!("Closing {} connections", connections.len());
        let closing = join_all(
            connections
                .into_iter()
                .map(|connection| self.dispose_and_remove(connection)),
        );

        if tokio::time::timeout(*self.config.get_shutdown_timeout(), closing)
            .await
            .is_err()
        {
            warn!(
                "{} connections did not close within {:?}, abandoning them",
                self.connections.len(),
                *self.config.get_shutdown_timeout()
            );
            for id in self.connection_ids() {
                self.remove(&id);
            }
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for connection in self.snapshot() {
            stats.total_connections += 1;
            match connection.status().await {
                ConnectionStatus::Inactive => stats.inactive_connections += 1,
                ConnectionStatus::Active => stats.active_connections += 1,
                ConnectionStatus::Disposed => stats.disposed_connections += 1,
            }
        }
        stats
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfigBuilder;
    use crate::connection::{spawn_shared, TransportOutcome};
    use crate::error::RealtimeError;
    use std::io;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn registry() -> Arc<ConnectionRegistry> {
        let config = RealtimeConfigBuilder::testing()
            .build()
            .expect("Failed to build config");
        Arc::new(ConnectionRegistry::new(config))
    }

    async fn age(connection: &Connection, by: chrono::Duration) {
        let mut state = connection.lock().await;
        state.last_seen = Utc::now() - by;
    }

    async fn wait_until_removed(registry: &ConnectionRegistry, id: &ConnectionId) -> bool {
        for _ in 0..50 {
            if registry.try_get(id).is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_create_get_and_remove() {
        let registry = registry();
        let connection = registry.create_connection();
        let id = connection.id().clone();

        assert!(registry.try_get(&id).is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let registry = registry();
        let mut events = registry.subscribe_events();

        let connection = registry.create_connection();
        let id = connection.id().clone();
        registry.remove(&id);
        registry.remove(&id);

        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Created(id.clone()));
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Removed(id));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_reaps_idle_inactive_connections() {
        let registry = registry();
        let idle = registry.create_connection();
        let fresh = registry.create_connection();
        age(&idle, chrono::Duration::seconds(10)).await;

        assert_eq!(registry.scan().await, Some(1));
        assert!(wait_until_removed(&registry, idle.id()).await);
        assert_eq!(idle.status().await, ConnectionStatus::Disposed);
        assert!(registry.try_get(fresh.id()).is_some());
    }

    #[tokio::test]
    async fn test_scan_never_reaps_active_connections() {
        let registry = registry();
        let active = registry.create_connection();
        {
            let mut state = active.lock().await;
            state.status = ConnectionStatus::Active;
            state.last_seen = Utc::now() - chrono::Duration::hours(1);
        }

        assert_eq!(registry.scan().await, Some(0));
        assert!(registry.try_get(active.id()).is_some());
    }

    #[tokio::test]
    async fn test_scan_respects_disabled_reaping() {
        let config = RealtimeConfigBuilder::testing()
            .reaping_enabled(false)
            .build()
            .expect("Failed to build config");
        let registry = Arc::new(ConnectionRegistry::new(config));
        let idle = registry.create_connection();
        age(&idle, chrono::Duration::seconds(10)).await;

        assert_eq!(registry.scan().await, Some(0));
        assert!(registry.try_get(idle.id()).is_some());
    }

    #[tokio::test]
    async fn test_overlapping_scan_is_skipped() {
        let registry = registry();
        let _running = registry.scan_lock.lock().await;
        assert_eq!(registry.scan().await, None);
    }

    #[tokio::test]
    async fn test_heartbeat_loop_reaps_in_background() {
        let registry = registry();
        let idle = registry.create_connection();
        age(&idle, chrono::Duration::seconds(10)).await;

        registry.start_heartbeat();
        assert!(wait_until_removed(&registry, idle.id()).await);
        registry.stop_heartbeat();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dispose_failure_still_removes() {
        let registry = registry();
        let connection = registry.create_connection();
        let task = spawn_shared::<TransportOutcome, _>(async {
            Err(RealtimeError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset by peer",
            )))
        });
        connection.lock().await.transport_task = Some(task);

        registry.dispose_and_remove(connection.clone()).await;

        assert!(registry.try_get(connection.id()).is_none());
        assert!(logs_contain("reset by the client"));
    }

    #[tokio::test]
    async fn test_close_all_disposes_everything() {
        let registry = registry();
        let connections: Vec<_> = (0..3).map(|_| registry.create_connection()).collect();

        registry.close_all().await;

        assert!(registry.is_empty());
        for connection in connections {
            assert_eq!(connection.status().await, ConnectionStatus::Disposed);
        }
    }

    #[tokio::test]
    async fn test_stats_count_by_status() {
        let registry = registry();
        let active = registry.create_connection();
        registry.create_connection();
        active.lock().await.status = ConnectionStatus::Active;

        let stats = registry.stats().await;
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.inactive_connections, 1);
    }
}
