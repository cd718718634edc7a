//! Per-request transport state machine
//!
//! Every HTTP request against the realtime endpoint lands here. Negotiate
//! creates a connection, send feeds its inbound pipe, connect attaches a
//! transport and terminate tears a long-polling connection down. Status and
//! task fields are only read or written under the connection lock.

use super::negotiate::NegotiateResponse;
use super::{long_polling, sse, websocket};
use crate::connection::{
    spawn_shared, start_application, Connection, ConnectionHandler, ConnectionId,
    ConnectionRegistry, ConnectionState, ConnectionStatus, HeaderUserIdProvider, SharedTask,
    TransportOutcome, TransportType, UserIdProvider,
};
use crate::error::{RealtimeError, RealtimeResult};
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Dispatches negotiate, send, connect and terminate requests
pub struct TransportDispatcher {
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    user_ids: Arc<dyn UserIdProvider>,
}

impl TransportDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            registry,
            handler,
            user_ids: Arc::new(HeaderUserIdProvider::default()),
        }
    }

    pub fn with_user_id_provider(mut self, provider: Arc<dyn UserIdProvider>) -> Self {
        self.user_ids = provider;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Create an inactive connection and describe how to reach it
    pub fn negotiate(&self) -> NegotiateResponse {
        let connection = self.registry.create_connection();
        debug!("Negotiated connection {}", connection.id());
        NegotiateResponse::new(
            connection.id().clone(),
            *self.registry.config().get_transports(),
        )
    }

    /// Write a client message into the connection's inbound pipe.
    ///
    /// Waits while the pipe is full. If the connection is disposed while
    /// waiting the send fails as not found.
    pub async fn send(&self, id: Option<&str>, headers: &HeaderMap, body: Bytes) -> RealtimeResult<()> {
        let connection = self.lookup(id)?;
        self.record_request(&connection, headers, "send");

        {
            let state = connection.lock().await;
            if state.status.is_disposed() {
                return Err(RealtimeError::not_found(connection.id().as_str()));
            }
            if state.transport_type == Some(TransportType::WebSockets) {
                return Err(RealtimeError::SendNotAllowed);
            }
        }

        connection
            .channel()
            .inbound
            .write(body)
            .await
            .map_err(|_| RealtimeError::not_found(connection.id().as_str()))
    }

    /// Attach a transport to a connection
    pub async fn connect(
        &self,
        id: Option<&str>,
        transport: TransportType,
        headers: &HeaderMap,
        upgrade: Option<WebSocketUpgrade>,
    ) -> RealtimeResult<Response> {
        let connection = self.lookup(id)?;

        if !self.registry.config().get_transports().contains(transport) {
            return Err(RealtimeError::TransportNotSupported {
                requested: transport,
            });
        }

        self.record_request(&connection, headers, "connect");

        match transport {
            TransportType::WebSockets => {
                let upgrade = upgrade.ok_or_else(|| {
                    RealtimeError::protocol("WebSocket transport requires an upgrade request")
                })?;
                self.connect_websocket(connection, headers, upgrade).await
            }
            TransportType::ServerSentEvents => self.connect_sse(connection, headers).await,
            TransportType::LongPolling => self.poll(connection, headers).await,
        }
    }

    /// Close a long-polling connection on the client's request
    pub async fn terminate(&self, id: Option<&str>) -> RealtimeResult<()> {
        let connection = self.lookup(id)?;

        {
            let state = connection.lock().await;
            if state.status.is_disposed() {
                return Err(RealtimeError::not_found(connection.id().as_str()));
            }
            if state.transport_type != Some(TransportType::LongPolling) {
                return Err(RealtimeError::TerminateNotAllowed);
            }
        }

        info!("Terminating connection {} on client request", connection.id());
        self.registry.dispose_and_remove(connection).await;
        Ok(())
    }

    async fn connect_websocket(
        &self,
        connection: Arc<Connection>,
        headers: &HeaderMap,
        upgrade: WebSocketUpgrade,
    ) -> RealtimeResult<Response> {
        let (socket_tx, socket_rx) = oneshot::channel();
        let close_timeout = *self.registry.config().get_websocket_close_timeout();
        let side = connection.transport();

        self.start_persistent(&connection, TransportType::WebSockets, headers, |token| {
            spawn_shared(websocket::run(socket_rx, side, token, close_timeout))
        })
        .await?;

        Ok(upgrade.on_upgrade(move |socket| async move {
            let _ = socket_tx.send(socket);
        }))
    }

    async fn connect_sse(
        &self,
        connection: Arc<Connection>,
        headers: &HeaderMap,
    ) -> RealtimeResult<Response> {
        let (events, response) = sse::channel();
        let side = connection.transport();

        self.start_persistent(
            &connection,
            TransportType::ServerSentEvents,
            headers,
            |token| spawn_shared(sse::run(side, events, token)),
        )
        .await?;

        Ok(response)
    }

    /// Activate a connection for a persistent transport and supervise the session.
    ///
    /// The session ends when either the application or the transport finishes;
    /// the other one is signalled and the connection is disposed.
    async fn start_persistent<F>(
        &self,
        connection: &Arc<Connection>,
        transport: TransportType,
        headers: &HeaderMap,
        start_transport: F,
    ) -> RealtimeResult<()>
    where
        F: FnOnce(CancellationToken) -> SharedTask<TransportOutcome>,
    {
        let (application_task, transport_task) = {
            let mut state = connection.lock().await;
            self.check_connectable(connection, &state, transport)?;
            if state.status == ConnectionStatus::Active {
                return Err(RealtimeError::ConcurrentRequestConflict {
                    connection_id: connection.id().clone(),
                });
            }

            state.status = ConnectionStatus::Active;
            state.transport_type = Some(transport);
            let application_task = self.ensure_application(connection, &mut state, headers);

            let token = CancellationToken::new();
            let transport_task = start_transport(token.clone());
            state.cancellation = Some(token);
            state.transport_task = Some(transport_task.clone());
            (application_task, transport_task)
        };

        info!("Connection {} connected over {}", connection.id(), transport);

        let registry = self.registry.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = application_task => {
                    debug!("Application for {} ended first", connection.id());
                }
                _ = transport_task => {
                    debug!("Transport for {} ended first", connection.id());
                    connection.channel().inbound.complete();
                }
            }
            registry.dispose_and_remove(connection).await;
        });

        Ok(())
    }

    /// One long-polling cycle
    async fn poll(&self, connection: Arc<Connection>, headers: &HeaderMap) -> RealtimeResult<Response> {
        let poll_timeout = *self.registry.config().get_long_poll_timeout();

        let (generation, token, poll_task) = {
            let mut state = connection.lock().await;
            self.check_connectable(&connection, &state, TransportType::LongPolling)?;

            if state.status == ConnectionStatus::Active {
                debug!("Superseding outstanding poll for {}", connection.id());
                if let Some(previous) = state.cancellation.take() {
                    previous.cancel();
                }
                if let Some(previous) = state.transport_task.take() {
                    let _ = previous.await;
                }
            }

            state.status = ConnectionStatus::Active;
            state.transport_type = Some(TransportType::LongPolling);
            let _ = self.ensure_application(&connection, &mut state, headers);

            state.poll_generation += 1;
            let token = CancellationToken::new();
            let poll_task = spawn_shared(long_polling::poll(
                connection.transport(),
                token.clone(),
                poll_timeout,
            ));
            state.cancellation = Some(token.clone());
            state.transport_task = Some(poll_task.clone());
            (state.poll_generation, token, poll_task)
        };

        // Dropping the request cancels the poll; the bookkeeping below runs regardless
        let _abort_guard = token.drop_guard();
        let finishing = tokio::spawn(finish_poll(
            self.registry.clone(),
            connection,
            generation,
            poll_task,
        ));

        let outcome = finishing
            .await
            .map_err(|err| RealtimeError::TaskFailed(err.to_string()))??;
        Ok(long_polling::poll_response(outcome))
    }

    fn check_connectable(
        &self,
        connection: &Connection,
        state: &ConnectionState,
        requested: TransportType,
    ) -> RealtimeResult<()> {
        if state.status.is_disposed() {
            return Err(RealtimeError::not_found(connection.id().as_str()));
        }
        match state.transport_type {
            Some(pinned) if pinned != requested => {
                Err(RealtimeError::TransportMismatch { pinned, requested })
            }
            _ => Ok(()),
        }
    }

    /// Start the application task on first connect, returning the running task
    fn ensure_application(
        &self,
        connection: &Connection,
        state: &mut ConnectionState,
        headers: &HeaderMap,
    ) -> SharedTask<()> {
        if let Some(task) = &state.application_task {
            return task.clone();
        }

        connection.set_user_id(self.user_ids.user_id(headers));
        let task = start_application(self.handler.clone(), connection);
        state.application_task = Some(task.clone());
        task
    }

    fn lookup(&self, id: Option<&str>) -> RealtimeResult<Arc<Connection>> {
        let id = match id {
            Some(id) if !id.is_empty() => ConnectionId::from(id),
            _ => return Err(RealtimeError::MissingConnectionId),
        };
        self.registry
            .try_get(&id)
            .ok_or_else(|| RealtimeError::not_found(id.as_str()))
    }

    fn record_request(&self, connection: &Connection, headers: &HeaderMap, kind: &str) {
        if let Some(agent) = headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
        {
            connection.set_item("user-agent", agent);
        }
        connection.set_item("last-request", kind);
    }
}

/// Settle a finished poll.
///
/// A finished application ends the connection. Otherwise the connection goes
/// back to inactive, but only if no newer poll has taken it over meanwhile.
async fn finish_poll(
    registry: Arc<ConnectionRegistry>,
    connection: Arc<Connection>,
    generation: u64,
    poll_task: SharedTask<TransportOutcome>,
) -> RealtimeResult<TransportOutcome> {
    match poll_task.await {
        Ok(TransportOutcome::ApplicationEnded) => {
            debug!("Application for {} finished, closing poll", connection.id());
            registry.dispose_and_remove(connection).await;
            Ok(TransportOutcome::ApplicationEnded)
        }
        Ok(outcome) => {
            let mut state = connection.lock().await;
            if state.poll_generation == generation && state.status == ConnectionStatus::Active {
                state.status = ConnectionStatus::Inactive;
                state.last_seen = Utc::now();
                state.cancellation = None;
                state.transport_task = None;
            }
            Ok(outcome)
        }
        Err(failure) => {
            registry.dispose_and_remove(connection).await;
            Err(failure.into_error())
        }
    }
}
