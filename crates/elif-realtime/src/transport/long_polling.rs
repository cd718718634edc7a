//! Long-polling transport: one request collects whatever the application queued

use crate::connection::{DuplexSide, TransportOutcome};
use crate::error::RealtimeResult;
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wait for outbound messages, the poll timeout or cancellation, whichever comes first.
///
/// Cancellation takes priority so a superseded poll never consumes messages
/// meant for the poll replacing it.
pub async fn poll(
    side: DuplexSide,
    cancellation: CancellationToken,
    timeout: Duration,
) -> RealtimeResult<TransportOutcome> {
    let outcome = tokio::select! {
        biased;
        _ = cancellation.cancelled() => TransportOutcome::Superseded,
        batch = side.input.read_batch() => match batch {
            Some(messages) => TransportOutcome::Polled(messages),
            None => TransportOutcome::ApplicationEnded,
        },
        _ = tokio::time::sleep(timeout) => TransportOutcome::TimedOut,
    };
    Ok(outcome)
}

/// HTTP response for a finished poll
pub fn poll_response(outcome: TransportOutcome) -> Response {
    match outcome {
        TransportOutcome::Polled(messages) => {
            let body: Vec<u8> = messages.iter().flat_map(|m| m.iter().copied()).collect();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                Body::from(Bytes::from(body)),
            )
                .into_response()
        }
        TransportOutcome::TimedOut => StatusCode::OK.into_response(),
        TransportOutcome::Superseded
        | TransportOutcome::ApplicationEnded
        | TransportOutcome::Completed => StatusCode::NO_CONTENT.into_response(),
    }
}
