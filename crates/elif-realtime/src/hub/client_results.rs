//! Correlation of server-to-client invocations with their completions

use super::protocol::CompletionMessage;
use crate::connection::ConnectionId;
use crate::error::{RealtimeError, RealtimeResult};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

static INVOCATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Issues invocation ids unique across servers without coordination:
/// the server id followed by a process-wide counter
#[derive(Debug, Clone)]
pub struct InvocationIdGenerator {
    server_id: String,
}

impl InvocationIdGenerator {
    pub fn new<T: Into<String>>(server_id: T) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn next_id(&self) -> String {
        let counter = INVOCATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}", self.server_id, counter)
    }
}

struct PendingInvocation {
    connection_id: ConnectionId,
    sender: oneshot::Sender<RealtimeResult<Value>>,
}

/// Outstanding invocations awaiting a client result
#[derive(Default)]
pub struct ClientResultsManager {
    pending: DashMap<String, PendingInvocation>,
}

impl ClientResultsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invocation and get the slot its result will arrive in
    pub fn add_invocation(
        &self,
        invocation_id: &str,
        connection_id: &ConnectionId,
    ) -> oneshot::Receiver<RealtimeResult<Value>> {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            invocation_id.to_string(),
            PendingInvocation {
                connection_id: connection_id.clone(),
                sender,
            },
        );
        receiver
    }

    /// Resolve a pending invocation from a client completion.
    ///
    /// Returns `Ok(false)` for an id nobody is waiting on. A completion from a
    /// connection other than the one invoked is rejected and the invocation
    /// stays pending.
    pub fn try_complete(
        &self,
        connection_id: &ConnectionId,
        completion: CompletionMessage,
    ) -> RealtimeResult<bool> {
        let invocation_id = completion.invocation_id.clone();

        if let Some(entry) = self.pending.get(&invocation_id) {
            if entry.connection_id != *connection_id {
                return Err(RealtimeError::InvalidCompletion(format!(
                    "connection {} returned a result for invocation {} sent to {}",
                    connection_id, invocation_id, entry.connection_id
                )));
            }
        }

        match self.pending.remove(&invocation_id) {
            Some((_, pending)) => {
                let _ = pending.sender.send(completion.into_result());
                Ok(true)
            }
            None => {
                debug!("No pending invocation {}", invocation_id);
                Ok(false)
            }
        }
    }

    /// Resolve a pending invocation whose origin was already verified elsewhere
    pub fn complete(&self, completion: CompletionMessage) -> bool {
        match self.pending.remove(&completion.invocation_id) {
            Some((_, pending)) => {
                let _ = pending.sender.send(completion.into_result());
                true
            }
            None => false,
        }
    }

    /// Fail a pending invocation with `error`
    pub fn fail(&self, invocation_id: &str, error: RealtimeError) -> bool {
        match self.pending.remove(invocation_id) {
            Some((_, pending)) => {
                let _ = pending.sender.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every invocation targeting a connection that went away
    pub fn fail_connection(&self, connection_id: &ConnectionId) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.connection_id == *connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &ids {
            self.fail(
                id,
                RealtimeError::ConnectionDisconnected {
                    connection_id: connection_id.clone(),
                },
            );
        }
        ids.len()
    }

    pub fn remove(&self, invocation_id: &str) -> bool {
        self.pending.remove(invocation_id).is_some()
    }

    pub fn contains(&self, invocation_id: &str) -> bool {
        self.pending.contains_key(invocation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait for a registered invocation's result.
    ///
    /// Cancelling `cancellation` forgets the invocation and yields
    /// [`RealtimeError::InvocationCanceled`].
    pub async fn wait(
        &self,
        invocation_id: &str,
        receiver: oneshot::Receiver<RealtimeResult<Value>>,
        cancellation: CancellationToken,
    ) -> RealtimeResult<Value> {
        tokio::select! {
            result = receiver => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!("Invocation {} was dropped without a result", invocation_id);
                    Err(RealtimeError::InvocationCanceled)
                }
            },
            _ = cancellation.cancelled() => {
                self.remove(invocation_id);
                Err(RealtimeError::InvocationCanceled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_ids_are_unique_and_prefixed() {
        let generator = InvocationIdGenerator::new("server-a");
        let first = generator.next_id();
        let second = generator.next_id();

        assert!(first.starts_with("server-a:"));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_completion_resolves_pending_invocation() {
        let results = ClientResultsManager::new();
        let connection = ConnectionId::from("c1");
        let receiver = results.add_invocation("s:1", &connection);

        let completed = results
            .try_complete(&connection, CompletionMessage::with_result("s:1", json!(5)))
            .unwrap();
        assert!(completed);

        let value = results
            .wait("s:1", receiver, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, json!(5));
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_completion_is_ignored() {
        let results = ClientResultsManager::new();
        let completed = results
            .try_complete(
                &ConnectionId::from("c1"),
                CompletionMessage::with_result("s:404", json!(1)),
            )
            .unwrap();
        assert!(!completed);
    }

    #[tokio::test]
    async fn test_completion_from_wrong_connection_is_rejected() {
        let results = ClientResultsManager::new();
        let _receiver = results.add_invocation("s:1", &ConnectionId::from("c1"));

        let err = results
            .try_complete(
                &ConnectionId::from("c2"),
                CompletionMessage::with_result("s:1", json!(1)),
            )
            .unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidCompletion(_)));
        assert!(results.contains("s:1"));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_invocations() {
        let results = ClientResultsManager::new();
        let connection = ConnectionId::from("c1");
        let receiver = results.add_invocation("s:1", &connection);

        assert_eq!(results.fail_connection(&connection), 1);
        let err = results
            .wait("s:1", receiver, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::ConnectionDisconnected { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_removes_pending_entry() {
        let results = ClientResultsManager::new();
        let receiver = results.add_invocation("s:1", &ConnectionId::from("c1"));
        let token = CancellationToken::new();
        token.cancel();

        let err = results.wait("s:1", receiver, token).await.unwrap_err();
        assert!(matches!(err, RealtimeError::InvocationCanceled));
        assert!(!results.contains("s:1"));
    }
}
