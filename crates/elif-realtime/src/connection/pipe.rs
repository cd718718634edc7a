//! Duplex channel between a transport and the application
//!
//! Each direction is a [`Pipe`]: a bounded, ordered byte-message queue with a
//! completion signal. Writers suspend while the pipe is full. Once a pipe is
//! completed further writes fail, while readers still drain whatever was
//! buffered before seeing end-of-stream.

use crate::error::{RealtimeError, RealtimeResult};
use axum::body::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One direction of a duplex channel
#[derive(Debug)]
pub struct Pipe {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    completed: CancellationToken,
}

impl Pipe {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            completed: CancellationToken::new(),
        }
    }

    /// Write a message, waiting for room if the pipe is full.
    ///
    /// Fails with [`RealtimeError::ChannelClosed`] if the pipe is completed
    /// before or while waiting.
    pub async fn write(&self, data: Bytes) -> RealtimeResult<()> {
        if self.completed.is_cancelled() {
            return Err(RealtimeError::ChannelClosed);
        }

        tokio::select! {
            biased;
            _ = self.completed.cancelled() => Err(RealtimeError::ChannelClosed),
            result = self.tx.send(data) => result.map_err(|_| RealtimeError::ChannelClosed),
        }
    }

    /// Read the next message, `None` once the pipe is completed and drained
    pub async fn read(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        Self::next(&mut rx, &self.completed).await
    }

    /// Wait for at least one message and take everything buffered behind it
    pub async fn read_batch(&self) -> Option<Vec<Bytes>> {
        let mut rx = self.rx.lock().await;
        let first = Self::next(&mut rx, &self.completed).await?;

        let mut batch = vec![first];
        while let Ok(message) = rx.try_recv() {
            batch.push(message);
        }
        Some(batch)
    }

    async fn next(
        rx: &mut mpsc::Receiver<Bytes>,
        completed: &CancellationToken,
    ) -> Option<Bytes> {
        tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = completed.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Mark the pipe complete. Idempotent.
    pub fn complete(&self) {
        self.completed.cancel();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_cancelled()
    }

    /// Resolves once the pipe has been completed
    pub async fn completed(&self) {
        self.completed.cancelled().await
    }
}

/// The two pipes of a connection
#[derive(Debug, Clone)]
pub struct DuplexChannel {
    /// Application to transport
    pub outbound: Arc<Pipe>,
    /// Transport to application
    pub inbound: Arc<Pipe>,
}

impl DuplexChannel {
    pub fn new(application_max_buffer: usize, transport_max_buffer: usize) -> Self {
        Self {
            outbound: Arc::new(Pipe::new(application_max_buffer)),
            inbound: Arc::new(Pipe::new(transport_max_buffer)),
        }
    }

    /// View used by the application: reads inbound, writes outbound
    pub fn application(&self) -> DuplexSide {
        DuplexSide {
            input: self.inbound.clone(),
            output: self.outbound.clone(),
        }
    }

    /// View used by a transport: reads outbound, writes inbound
    pub fn transport(&self) -> DuplexSide {
        DuplexSide {
            input: self.outbound.clone(),
            output: self.inbound.clone(),
        }
    }

    /// Complete both directions
    pub fn complete(&self) {
        self.outbound.complete();
        self.inbound.complete();
    }
}

/// One party's end of a duplex channel
#[derive(Debug, Clone)]
pub struct DuplexSide {
    pub input: Arc<Pipe>,
    pub output: Arc<Pipe>,
}

impl DuplexSide {
    pub async fn read(&self) -> Option<Bytes> {
        self.input.read().await
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> RealtimeResult<()> {
        self.output.write(data.into()).await
    }

    /// Signal that this side will write nothing further
    pub fn complete(&self) {
        self.output.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let pipe = Pipe::new(8);
        pipe.write(Bytes::from_static(b"one")).await.unwrap();
        pipe.write(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(pipe.read().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(pipe.read().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_buffered_data_is_drained_after_completion() {
        let pipe = Pipe::new(8);
        pipe.write(Bytes::from_static(b"last words")).await.unwrap();
        pipe.complete();

        assert_eq!(
            pipe.read().await.unwrap(),
            Bytes::from_static(b"last words")
        );
        assert!(pipe.read().await.is_none());
    }

    #[tokio::test]
    async fn test_write_after_completion_fails() {
        let pipe = Pipe::new(8);
        pipe.complete();

        let result = pipe.write(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(RealtimeError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_full_pipe_suspends_writer_until_completed() {
        let pipe = Arc::new(Pipe::new(1));
        pipe.write(Bytes::from_static(b"fill")).await.unwrap();

        let writer = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.write(Bytes::from_static(b"blocked")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        pipe.complete();
        let result = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert!(matches!(result, Err(RealtimeError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_read_batch_takes_everything_buffered() {
        let pipe = Pipe::new(8);
        for chunk in ["a", "b", "c"] {
            pipe.write(Bytes::from(chunk)).await.unwrap();
        }

        let batch = pipe.read_batch().await.unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn test_duplex_sides_are_crossed() {
        let channel = DuplexChannel::new(4, 4);
        let app = channel.application();
        let transport = channel.transport();

        transport.write(Bytes::from_static(b"from client")).await.unwrap();
        app.write(Bytes::from_static(b"from server")).await.unwrap();

        assert_eq!(app.read().await.unwrap(), Bytes::from_static(b"from client"));
        assert_eq!(
            transport.read().await.unwrap(),
            Bytes::from_static(b"from server")
        );

        app.complete();
        assert!(transport.read().await.is_none());
    }
}
