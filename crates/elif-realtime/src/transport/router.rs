//! HTTP surface of a realtime endpoint

use super::dispatcher::TransportDispatcher;
use crate::connection::TransportType;
use crate::error::RealtimeError;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionQuery {
    pub id: Option<String>,
}

/// Build the router for an endpoint mounted at `path`.
///
/// * `OPTIONS {path}` and `POST {path}/negotiate` negotiate
/// * `POST {path}?id=` sends
/// * `GET {path}?id=` connects
/// * `DELETE {path}?id=` terminates a long-polling connection
pub fn realtime_router(dispatcher: Arc<TransportDispatcher>, path: &str) -> Router {
    let path = if path.starts_with('/') {
        path.trim_end_matches('/').to_string()
    } else {
        format!("/{}", path.trim_end_matches('/'))
    };

    Router::new()
        .route(
            &path,
            get(connect).post(send).delete(terminate).options(negotiate),
        )
        .route(&format!("{}/negotiate", path), post(negotiate))
        .with_state(dispatcher)
}

async fn negotiate(State(dispatcher): State<Arc<TransportDispatcher>>) -> Response {
    Json(dispatcher.negotiate()).into_response()
}

async fn send(
    State(dispatcher): State<Arc<TransportDispatcher>>,
    Query(query): Query<ConnectionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, RealtimeError> {
    dispatcher.send(query.id.as_deref(), &headers, body).await?;
    Ok(StatusCode::OK)
}

async fn connect(
    State(dispatcher): State<Arc<TransportDispatcher>>,
    Query(query): Query<ConnectionQuery>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Result<Response, RealtimeError> {
    let transport = requested_transport(&headers, upgrade.is_some());
    dispatcher
        .connect(query.id.as_deref(), transport, &headers, upgrade)
        .await
}

async fn terminate(
    State(dispatcher): State<Arc<TransportDispatcher>>,
    Query(query): Query<ConnectionQuery>,
) -> Result<StatusCode, RealtimeError> {
    dispatcher.terminate(query.id.as_deref()).await?;
    Ok(StatusCode::ACCEPTED)
}

fn requested_transport(headers: &HeaderMap, is_upgrade: bool) -> TransportType {
    if is_upgrade {
        return TransportType::WebSockets;
    }

    let wants_events = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false);

    if wants_events {
        TransportType::ServerSentEvents
    } else {
        TransportType::LongPolling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_selection() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            requested_transport(&headers, false),
            TransportType::LongPolling
        );
        assert_eq!(
            requested_transport(&headers, true),
            TransportType::WebSockets
        );

        headers.insert(header::ACCEPT, "text/event-stream".parse().unwrap());
        assert_eq!(
            requested_transport(&headers, false),
            TransportType::ServerSentEvents
        );
    }
}
