//! Connection handler that speaks the hub protocol

use super::context::HubConnectionContext;
use super::lifetime_manager::HubLifetimeManager;
use super::protocol::{decode, CompletionMessage, HubMessage, InvocationMessage};
use crate::connection::{ConnectionContext, ConnectionHandler};
use crate::error::RealtimeResult;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handles invocations sent by clients
#[async_trait]
pub trait HubInvocationHandler: Send + Sync + 'static {
    async fn invoke(
        &self,
        caller: &HubConnectionContext,
        target: &str,
        arguments: Vec<Value>,
    ) -> RealtimeResult<Value>;
}

/// Registers each connection with a lifetime manager and routes its messages.
///
/// Completions go to the manager, invocations to the optional handler. The
/// connection is unregistered when the client goes away.
pub struct HubEndpoint<M: HubLifetimeManager + ?Sized> {
    manager: Arc<M>,
    invocations: Option<Arc<dyn HubInvocationHandler>>,
}

impl<M: HubLifetimeManager + ?Sized> HubEndpoint<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self {
            manager,
            invocations: None,
        }
    }

    pub fn with_invocation_handler(mut self, handler: Arc<dyn HubInvocationHandler>) -> Self {
        self.invocations = Some(handler);
        self
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    async fn receive(&self, context: &ConnectionContext, hub: &HubConnectionContext) {
        while let Some(frame) = context.read().await {
            let messages = match decode(&frame) {
                Ok(messages) => messages,
                Err(err) => {
                    warn!("Closing {}: {}", hub.connection_id, err);
                    let close = HubMessage::Close {
                        error: Some(err.to_string()),
                    };
                    let _ = hub.write(&close).await;
                    return;
                }
            };

            for message in messages {
                match message {
                    HubMessage::Completion(completion) => {
                        if let Err(err) = self
                            .manager
                            .set_connection_result(&hub.connection_id, completion)
                            .await
                        {
                            warn!("Rejected completion from {}: {}", hub.connection_id, err);
                        }
                    }
                    HubMessage::Invocation(invocation) => self.dispatch(hub, invocation),
                    HubMessage::Ping => {}
                    HubMessage::Close { .. } => {
                        debug!("Client {} sent close", hub.connection_id);
                        return;
                    }
                }
            }
        }
    }

    /// Answer an invocation from its own task.
    ///
    /// The read loop keeps running meanwhile, so a handler may await a client
    /// result from its own caller. Invocations from one connection can
    /// complete out of order.
    fn dispatch(&self, hub: &HubConnectionContext, invocation: InvocationMessage) {
        let Some(handler) = self.invocations.clone() else {
            debug!(
                "No invocation handler for '{}' from {}",
                invocation.target, hub.connection_id
            );
            return;
        };

        let hub = hub.clone();
        tokio::spawn(async move {
            let result = handler
                .invoke(&hub, &invocation.target, invocation.arguments)
                .await;

            let Some(invocation_id) = invocation.invocation_id else {
                return;
            };
            let completion = match result {
                Ok(value) => CompletionMessage::with_result(invocation_id, value),
                Err(err) => CompletionMessage::with_error(invocation_id, err.to_string()),
            };
            if let Err(err) = hub.write(&HubMessage::Completion(completion)).await {
                warn!("Could not answer {}: {}", hub.connection_id, err);
            }
        });
    }
}

#[async_trait]
impl<M: HubLifetimeManager + ?Sized> ConnectionHandler for HubEndpoint<M> {
    async fn on_connected(&self, context: ConnectionContext) -> RealtimeResult<()> {
        let hub = HubConnectionContext::new(
            context.connection_id.clone(),
            context.user_id.clone(),
            context.channel().clone(),
        );

        self.manager.on_connected(hub.clone()).await?;
        self.receive(&context, &hub).await;

        if let Err(err) = self.manager.on_disconnected(&hub.connection_id).await {
            warn!("Failed to unregister {}: {}", hub.connection_id, err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, DuplexChannel, DuplexSide};
    use crate::error::RealtimeError;
    use crate::hub::default_manager::DefaultHubLifetimeManager;
    use crate::hub::protocol::encode;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Adder;

    #[async_trait]
    impl HubInvocationHandler for Adder {
        async fn invoke(
            &self,
            _caller: &HubConnectionContext,
            target: &str,
            arguments: Vec<Value>,
        ) -> RealtimeResult<Value> {
            match target {
                "Add" => Ok(json!(arguments.iter().filter_map(Value::as_i64).sum::<i64>())),
                other => Err(RealtimeError::protocol(format!("unknown method {}", other))),
            }
        }
    }

    #[tokio::test]
    async fn test_endpoint_answers_invocations_and_unregisters() {
        let manager = Arc::new(DefaultHubLifetimeManager::new());
        let endpoint = Arc::new(HubEndpoint::new(manager.clone()).with_invocation_handler(Arc::new(Adder)));
        let channel = DuplexChannel::new(8, 8);
        let context = ConnectionContext::new(
            ConnectionId::from("c1"),
            None,
            Default::default(),
            channel.application(),
        );

        let running = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.on_connected(context).await })
        };

        let transport = channel.transport();
        let call = HubMessage::Invocation(InvocationMessage {
            invocation_id: Some("client:1".to_string()),
            target: "Add".to_string(),
            arguments: vec![json!(2), json!(3)],
        });
        transport.write(encode(&call).unwrap()).await.unwrap();

        let frame = transport.read().await.unwrap();
        assert_eq!(
            decode(&frame).unwrap(),
            vec![HubMessage::Completion(CompletionMessage::with_result("client:1", json!(5)))]
        );
        assert_eq!(manager.connection_count(), 1);

        transport.complete();
        running.await.unwrap().unwrap();
        assert_eq!(manager.connection_count(), 0);
    }

    async fn next_message(transport: &DuplexSide) -> HubMessage {
        let frame = tokio::time::timeout(Duration::from_secs(1), transport.read())
            .await
            .expect("Timed out waiting for the server")
            .unwrap();
        decode(&frame).unwrap().remove(0)
    }

    /// Asks the calling client for its name before answering
    struct Greeter {
        manager: Arc<DefaultHubLifetimeManager>,
    }

    #[async_trait]
    impl HubInvocationHandler for Greeter {
        async fn invoke(
            &self,
            caller: &HubConnectionContext,
            _target: &str,
            _arguments: Vec<Value>,
        ) -> RealtimeResult<Value> {
            let name = self
                .manager
                .invoke_connection_raw(&caller.connection_id, "Name", vec![], CancellationToken::new())
                .await?;
            Ok(json!(format!("hello {}", name.as_str().unwrap_or("stranger"))))
        }
    }

    #[tokio::test]
    async fn test_handler_can_await_result_from_its_caller() {
        let manager = Arc::new(DefaultHubLifetimeManager::new());
        let endpoint = Arc::new(
            HubEndpoint::new(manager.clone()).with_invocation_handler(Arc::new(Greeter {
                manager: manager.clone(),
            })),
        );
        let channel = DuplexChannel::new(8, 8);
        let context = ConnectionContext::new(
            ConnectionId::from("c1"),
            None,
            Default::default(),
            channel.application(),
        );
        let running = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.on_connected(context).await })
        };

        let transport = channel.transport();

        let greet = HubMessage::Invocation(InvocationMessage {
            invocation_id: Some("client:1".to_string()),
            target: "Greet".to_string(),
            arguments: vec![],
        });
        transport.write(encode(&greet).unwrap()).await.unwrap();

        let HubMessage::Invocation(question) = next_message(&transport).await else {
            panic!("Expected the server to ask for a name");
        };
        assert_eq!(question.target, "Name");
        let answer = CompletionMessage::with_result(question.invocation_id.unwrap(), json!("alice"));
        transport
            .write(encode(&HubMessage::Completion(answer)).unwrap())
            .await
            .unwrap();

        assert_eq!(
            next_message(&transport).await,
            HubMessage::Completion(CompletionMessage::with_result("client:1", json!("hello alice")))
        );

        transport.complete();
        running.await.unwrap().unwrap();
    }
}
