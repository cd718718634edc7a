//! WebSocket transport

use crate::connection::{DuplexSide, TransportOutcome};
use crate::error::{RealtimeError, RealtimeResult};
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use std::io;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const NORMAL_CLOSURE: u16 = 1000;

/// Pump messages between an upgraded socket and the connection's duplex channel.
///
/// The socket arrives through `socket` once the HTTP upgrade completes; if the
/// upgrade never happens the loop ends straight away. When the application
/// finishes, a close frame is sent and the client's close is awaited for at
/// most `close_timeout`.
pub async fn run(
    socket: oneshot::Receiver<WebSocket>,
    side: DuplexSide,
    cancellation: CancellationToken,
    close_timeout: Duration,
) -> RealtimeResult<TransportOutcome> {
    let Ok(mut socket) = socket.await else {
        debug!("WebSocket upgrade did not complete");
        return Ok(TransportOutcome::Completed);
    };

    loop {
        tokio::select! {
            biased;

            _ = cancellation.cancelled() => {
                let _ = socket.send(close_message()).await;
                await_client_close(&mut socket, close_timeout).await;
                break;
            }

            outbound = side.read() => match outbound {
                Some(data) => {
                    socket.send(to_message(data)).await.map_err(reset)?;
                }
                None => {
                    debug!("Application finished, closing WebSocket");
                    let _ = socket.send(close_message()).await;
                    await_client_close(&mut socket, close_timeout).await;
                    break;
                }
            },

            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => side.write(Bytes::from(text)).await?,
                Some(Ok(Message::Binary(data))) => side.write(Bytes::from(data)).await?,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Client closed WebSocket");
                    break;
                }
                Some(Err(err)) => return Err(reset(err)),
            },
        }
    }

    Ok(TransportOutcome::Completed)
}

async fn await_client_close(socket: &mut WebSocket, close_timeout: Duration) {
    let waiting = async {
        while let Some(Ok(message)) = socket.recv().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    };

    if tokio::time::timeout(close_timeout, waiting).await.is_err() {
        debug!("Client did not acknowledge close within {:?}", close_timeout);
    }
}

fn to_message(data: Bytes) -> Message {
    match String::from_utf8(data.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

fn close_message() -> Message {
    Message::Close(Some(CloseFrame {
        code: NORMAL_CLOSURE,
        reason: "".into(),
    }))
}

fn reset(err: axum::Error) -> RealtimeError {
    RealtimeError::Io(io::Error::new(io::ErrorKind::ConnectionReset, err))
}
