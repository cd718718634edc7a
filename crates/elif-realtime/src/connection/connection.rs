//! A single logical connection and its lifecycle state

use super::pipe::{DuplexChannel, DuplexSide};
use super::types::{ConnectionId, ConnectionStatus, TransportType};
use crate::error::{RealtimeError, RealtimeResult};
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Failure of a spawned connection task, cloneable so every waiter sees it
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub message: String,
    pub io_kind: Option<io::ErrorKind>,
}

impl TaskFailure {
    pub fn from_error(error: &RealtimeError) -> Self {
        let io_kind = match error {
            RealtimeError::Io(err) => Some(err.kind()),
            _ => None,
        };
        Self {
            message: error.to_string(),
            io_kind,
        }
    }

    pub fn into_error(self) -> RealtimeError {
        match self.io_kind {
            Some(kind) => RealtimeError::Io(io::Error::new(kind, self.message)),
            None => RealtimeError::TaskFailed(self.message),
        }
    }
}

/// How a transport task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOutcome {
    /// A persistent transport finished its session
    Completed,
    /// A poll collected messages for the client
    Polled(Vec<Bytes>),
    /// A poll ran out of time without data
    TimedOut,
    /// A poll was cancelled by a newer poll or by disposal
    Superseded,
    /// The application finished, the connection is over
    ApplicationEnded,
}

/// A spawned task that several parties can await
pub type SharedTask<T> = Shared<BoxFuture<'static, Result<T, TaskFailure>>>;

/// Spawn `future` on the runtime and return a handle any number of callers can await.
///
/// The task runs whether or not the handle is polled. A panic is reported as a
/// [`TaskFailure`].
pub fn spawn_shared<T, F>(future: F) -> SharedTask<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = RealtimeResult<T>> + Send + 'static,
{
    let handle = tokio::spawn(future);
    async move {
        match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskFailure::from_error(&err)),
            Err(join_err) => Err(TaskFailure {
                message: format!("task panicked or was aborted: {}", join_err),
                io_kind: None,
            }),
        }
    }
    .boxed()
    .shared()
}

/// Mutable lifecycle fields, only touched while holding the connection lock
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_seen: DateTime<Utc>,
    pub transport_type: Option<TransportType>,
    pub application_task: Option<SharedTask<()>>,
    pub transport_task: Option<SharedTask<TransportOutcome>>,
    /// Cancellation scoped to the current physical request
    pub cancellation: Option<CancellationToken>,
    /// Bumped for every long poll so a finished poll can tell whether it still owns the connection
    pub poll_generation: u64,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("status", &self.status)
            .field("last_seen", &self.last_seen)
            .field("transport_type", &self.transport_type)
            .field("application_running", &self.application_task.is_some())
            .field("transport_running", &self.transport_task.is_some())
            .field("poll_generation", &self.poll_generation)
            .finish()
    }
}

/// Request and principal details attached to a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    pub user_id: Option<String>,
    pub items: HashMap<String, String>,
}

type HeartbeatCallback = Box<dyn Fn() + Send + Sync>;

/// A logical connection, owned by the registry
pub struct Connection {
    id: ConnectionId,
    state: Mutex<ConnectionState>,
    channel: DuplexChannel,
    metadata: RwLock<ConnectionMetadata>,
    heartbeat: RwLock<Vec<HeartbeatCallback>>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Connection {
    pub fn new(id: ConnectionId, channel: DuplexChannel) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Inactive,
                last_seen: now,
                transport_type: None,
                application_task: None,
                transport_task: None,
                cancellation: None,
                poll_generation: 0,
            }),
            channel,
            metadata: RwLock::new(ConnectionMetadata::default()),
            heartbeat: RwLock::new(Vec::new()),
            created_at: now,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire the connection lock
    pub async fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().await
    }

    /// Status and last-seen time, read under the lock
    pub async fn snapshot(&self) -> (ConnectionStatus, DateTime<Utc>) {
        let state = self.state.lock().await;
        (state.status, state.last_seen)
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub fn channel(&self) -> &DuplexChannel {
        &self.channel
    }

    /// The application's end of the duplex channel
    pub fn application(&self) -> DuplexSide {
        self.channel.application()
    }

    /// The transport's end of the duplex channel
    pub fn transport(&self) -> DuplexSide {
        self.channel.transport()
    }

    pub fn metadata(&self) -> ConnectionMetadata {
        self.metadata.read().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.metadata.read().user_id.clone()
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        self.metadata.write().user_id = user_id;
    }

    pub fn set_item<K: Into<String>, V: Into<String>>(&self, key: K, value: V) {
        self.metadata.write().items.insert(key.into(), value.into());
    }

    pub fn item(&self, key: &str) -> Option<String> {
        self.metadata.read().items.get(key).cloned()
    }

    /// Register a callback run on every heartbeat tick while the connection is alive
    pub fn on_heartbeat<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.heartbeat.write().push(Box::new(callback));
    }

    /// Run the heartbeat callbacks
    pub fn tick_heartbeat(&self) {
        for callback in self.heartbeat.read().iter() {
            callback();
        }
    }

    /// Tear the connection down.
    ///
    /// Marks it disposed, cancels the current request, completes both pipes and
    /// waits up to `close_timeout` for each running task. Disposing twice is a
    /// no-op. A transport that ended with an I/O error is reported as
    /// [`RealtimeError::Io`].
    pub async fn dispose(&self, close_timeout: Duration) -> RealtimeResult<()> {
        let (application_task, transport_task) = {
            let mut state = self.state.lock().await;
            if state.status.is_disposed() {
                return Ok(());
            }
            state.status = ConnectionStatus::Disposed;
            if let Some(token) = state.cancellation.take() {
                token.cancel();
            }
            (state.application_task.take(), state.transport_task.take())
        };

        debug!("Disposing connection {}", self.id);
        self.channel.complete();
        self.heartbeat.write().clear();

        let mut failure = None;

        if let Some(task) = transport_task {
            match tokio::time::timeout(close_timeout, task).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => failure = Some(err),
                Err(_) => warn!(
                    "Transport for connection {} did not stop within {:?}",
                    self.id, close_timeout
                ),
            }
        }

        if let Some(task) = application_task {
            match tokio::time::timeout(close_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failure.get_or_insert(err);
                }
                Err(_) => warn!(
                    "Application for connection {} did not stop within {:?}",
                    self.id, close_timeout
                ),
            }
        }

        match failure {
            Some(err) => Err(err.into_error()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn connection() -> Connection {
        Connection::new(ConnectionId::new(), DuplexChannel::new(4, 4))
    }

    #[tokio::test]
    async fn test_new_connection_is_inactive() {
        let conn = connection();
        let (status, _) = conn.snapshot().await;
        assert_eq!(status, ConnectionStatus::Inactive);
        assert!(conn.lock().await.transport_type.is_none());
    }

    #[tokio::test]
    async fn test_dispose_is_terminal_and_idempotent() {
        let conn = connection();
        conn.dispose(Duration::from_millis(100)).await.unwrap();
        assert_eq!(conn.status().await, ConnectionStatus::Disposed);

        conn.dispose(Duration::from_millis(100)).await.unwrap();
        assert!(conn.channel().outbound.is_completed());
        assert!(conn.channel().inbound.is_completed());
    }

    #[tokio::test]
    async fn test_dispose_cancels_request_and_waits_for_transport() {
        let conn = connection();
        let token = CancellationToken::new();
        let observed = token.clone();
        let task = spawn_shared(async move {
            observed.cancelled().await;
            Ok(TransportOutcome::Superseded)
        });
        {
            let mut state = conn.lock().await;
            state.cancellation = Some(token.clone());
            state.transport_task = Some(task.clone());
        }

        conn.dispose(Duration::from_secs(1)).await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(task.await.unwrap(), TransportOutcome::Superseded);
    }

    #[tokio::test]
    async fn test_dispose_reports_io_failures() {
        let conn = connection();
        let task = spawn_shared::<TransportOutcome, _>(async {
            Err(RealtimeError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client went away",
            )))
        });
        conn.lock().await.transport_task = Some(task);

        let err = conn.dispose(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transport_reset());
    }

    #[tokio::test]
    async fn test_heartbeat_callbacks_run_until_disposed() {
        let conn = connection();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        conn.on_heartbeat(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        conn.tick_heartbeat();
        conn.tick_heartbeat();
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        conn.dispose(Duration::from_millis(100)).await.unwrap();
        conn.tick_heartbeat();
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_metadata_items() {
        let conn = connection();
        conn.set_item("user-agent", "test-client/1.0");
        conn.set_user_id(Some("alice".to_string()));

        assert_eq!(conn.item("user-agent").as_deref(), Some("test-client/1.0"));
        assert_eq!(conn.user_id().as_deref(), Some("alice"));
        assert!(conn.item("missing").is_none());
    }
}
