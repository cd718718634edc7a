//! Demo chat server exposing a hub at `/hub`

use async_trait::async_trait;
use elif_realtime::hub::HubConnectionContext;
use elif_realtime::logging::log_endpoint_info;
use elif_realtime::{
    init_logging, realtime_router, ConnectionRegistry, DefaultHubLifetimeManager, HubEndpoint,
    HubInvocationHandler, HubLifetimeManager, LoggingConfig, RealtimeConfig, RealtimeError,
    RealtimeResult, TransportDispatcher,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

const HUB_PATH: &str = "/hub";

struct ChatHub {
    manager: Arc<DefaultHubLifetimeManager>,
}

#[async_trait]
impl HubInvocationHandler for ChatHub {
    async fn invoke(
        &self,
        caller: &HubConnectionContext,
        target: &str,
        arguments: Vec<Value>,
    ) -> RealtimeResult<Value> {
        match target {
            "Broadcast" => {
                self.manager.send_all("ReceiveMessage", arguments).await?;
                Ok(Value::Null)
            }
            "JoinGroup" => {
                let group = group_argument(&arguments)?;
                self.manager.add_to_group(&caller.connection_id, group).await?;
                Ok(Value::Null)
            }
            "LeaveGroup" => {
                let group = group_argument(&arguments)?;
                self.manager
                    .remove_from_group(&caller.connection_id, group)
                    .await?;
                Ok(Value::Null)
            }
            "SendToGroup" => {
                let group = group_argument(&arguments)?.to_string();
                self.manager
                    .send_group(&group, "ReceiveMessage", arguments[1..].to_vec())
                    .await?;
                Ok(Value::Null)
            }
            "Echo" => Ok(arguments.into_iter().next().unwrap_or(Value::Null)),
            other => Err(RealtimeError::protocol(format!("unknown method '{}'", other))),
        }
    }
}

fn group_argument(arguments: &[Value]) -> RealtimeResult<&str> {
    arguments
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| RealtimeError::protocol("expected a group name as first argument"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(
        LoggingConfig::development().with_service("elif-realtime-server", env!("CARGO_PKG_VERSION")),
    )?;

    let config = RealtimeConfig::from_env()?;
    config.validate()?;

    let addr: SocketAddr = std::env::var("REALTIME_BIND")
        .unwrap_or_else(|_| "127.0.0.1:5000".to_string())
        .parse()?;

    let registry = Arc::new(ConnectionRegistry::new(config.clone()));
    registry.start_heartbeat();

    let manager = Arc::new(DefaultHubLifetimeManager::new());
    let endpoint = HubEndpoint::new(manager.clone()).with_invocation_handler(Arc::new(ChatHub {
        manager: manager.clone(),
    }));
    let dispatcher = Arc::new(TransportDispatcher::new(registry.clone(), Arc::new(endpoint)));

    let router = realtime_router(dispatcher, HUB_PATH);
    log_endpoint_info(HUB_PATH, &config);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Realtime server listening on {}", addr);

    // Open event streams and polls only end once their connections are closed
    let shutdown = {
        let registry = registry.clone();
        async move {
            shutdown_signal().await;
            registry.close_all().await;
        }
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Realtime server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
