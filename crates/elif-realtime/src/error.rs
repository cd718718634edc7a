//! Realtime error types
//!
//! A single taxonomy shared by the connection registry, the transport
//! dispatcher and the hub lifetime managers. The HTTP layer maps each variant
//! to a status code through [`RealtimeError::status_code`].

use crate::config::ConfigError;
use crate::connection::{ConnectionId, TransportType};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::io;
use thiserror::Error;

/// Result type for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Realtime errors
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Connection ID required")]
    MissingConnectionId,

    #[error("No Connection with that ID")]
    ConnectionNotFound { connection_id: String },

    #[error("{requested} transport not supported by this end point type")]
    TransportNotSupported { requested: TransportType },

    #[error("Cannot change transports mid-connection")]
    TransportMismatch {
        pinned: TransportType,
        requested: TransportType,
    },

    #[error("Connection {connection_id} already has an active request")]
    ConcurrentRequestConflict { connection_id: ConnectionId },

    #[error("POST requests are not allowed for WebSocket connections.")]
    SendNotAllowed,

    #[error("Cannot terminate this connection using the DELETE endpoint.")]
    TerminateNotAllowed,

    #[error("Connection '{connection_id}' disconnected.")]
    ConnectionDisconnected { connection_id: ConnectionId },

    #[error("Failed to deserialize client result: {0}")]
    ResultDeserialization(#[source] serde_json::Error),

    #[error("Failed to write to connection {connection_id}: {reason}")]
    TransportWrite {
        connection_id: ConnectionId,
        reason: String,
    },

    #[error("{0}")]
    InvocationFailed(String),

    #[error("Invocation canceled")]
    InvocationCanceled,

    #[error("Invalid completion: {0}")]
    InvalidCompletion(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Backplane error: {0}")]
    Backplane(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl RealtimeError {
    /// Create a not-found error for a connection id
    pub fn not_found<T: Into<String>>(connection_id: T) -> Self {
        RealtimeError::ConnectionNotFound {
            connection_id: connection_id.into(),
        }
    }

    /// Create a transport write error
    pub fn transport_write<T: Into<String>>(connection_id: &ConnectionId, reason: T) -> Self {
        RealtimeError::TransportWrite {
            connection_id: connection_id.clone(),
            reason: reason.into(),
        }
    }

    /// Create a backplane error
    pub fn backplane<T: Into<String>>(message: T) -> Self {
        RealtimeError::Backplane(message.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(message: T) -> Self {
        RealtimeError::Protocol(message.into())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RealtimeError::MissingConnectionId => StatusCode::BAD_REQUEST,
            RealtimeError::TransportMismatch { .. } => StatusCode::BAD_REQUEST,
            RealtimeError::TerminateNotAllowed => StatusCode::BAD_REQUEST,
            RealtimeError::ConnectionNotFound { .. } => StatusCode::NOT_FOUND,
            RealtimeError::TransportNotSupported { .. } => StatusCode::NOT_FOUND,
            // A pipe closed underneath a pending send means the connection was disposed
            RealtimeError::ChannelClosed => StatusCode::NOT_FOUND,
            RealtimeError::SendNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RealtimeError::ConcurrentRequestConflict { .. } => StatusCode::CONFLICT,
            RealtimeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is a peer reset / broken pipe on the transport.
    ///
    /// These are expected when clients vanish and are logged as warnings
    /// rather than errors.
    pub fn is_transport_reset(&self) -> bool {
        match self {
            RealtimeError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl IntoResponse for RealtimeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = if status.is_server_error() {
            // Internal details stay in the logs
            tracing::error!("Realtime request failed: {}", self);
            status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string()
        } else {
            self.to_string()
        };

        (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
    }
}
