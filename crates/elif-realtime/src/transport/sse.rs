//! Server-Sent Events transport

use crate::connection::{DuplexSide, TransportOutcome};
use crate::error::RealtimeResult;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type EventSender = mpsc::Sender<Result<Event, Infallible>>;

/// Create the event stream handed to the client and the sender the transport loop feeds
pub fn channel() -> (EventSender, Response) {
    let (tx, rx) = mpsc::channel(16);
    let response = Sse::new(event_stream(rx))
        .keep_alive(KeepAlive::default())
        .into_response();
    (tx, response)
}

fn event_stream(
    rx: mpsc::Receiver<Result<Event, Infallible>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
}

/// Forward outbound messages to the client as `data:` events until the
/// application finishes, the client goes away or the request is cancelled.
pub async fn run(
    side: DuplexSide,
    events: EventSender,
    cancellation: CancellationToken,
) -> RealtimeResult<TransportOutcome> {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            _ = events.closed() => {
                debug!("Event stream client disconnected");
                break;
            }
            message = side.read() => message,
        };

        let Some(message) = message else {
            debug!("Application finished, closing event stream");
            break;
        };

        let event = Event::default().data(String::from_utf8_lossy(&message));
        if events.send(Ok(event)).await.is_err() {
            debug!("Event stream client disconnected");
            break;
        }
    }

    Ok(TransportOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DuplexChannel;
    use axum::body::Bytes;

    #[tokio::test]
    async fn test_sse_loop_ends_when_application_finishes() {
        let channel = DuplexChannel::new(4, 4);
        let (tx, mut rx) = mpsc::channel(4);
        let app = channel.application();
        app.write(Bytes::from_static(b"update")).await.unwrap();
        app.complete();

        let outcome = run(channel.transport(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TransportOutcome::Completed);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_sse_loop_stops_when_client_leaves() {
        let channel = DuplexChannel::new(4, 4);
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        channel
            .application()
            .write(Bytes::from_static(b"nobody listening"))
            .await
            .unwrap();

        let outcome = run(channel.transport(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TransportOutcome::Completed);
    }
}
