//! Publish/subscribe contract shared by every server in a farm

use crate::error::RealtimeResult;
use async_trait::async_trait;
use axum::body::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Called for every message published on a subscribed topic
pub type BackplaneHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// A live topic subscription.
///
/// Delivery stops on [`Subscription::unsubscribe`] or when the value is dropped.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    cancellation: CancellationToken,
}

impl Subscription {
    pub fn new(topic: String, cancellation: CancellationToken) -> Self {
        Self {
            topic,
            cancellation,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(self) {
        self.cancellation.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancellation.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

/// Message fabric connecting servers.
///
/// Delivery is at-least-once to the servers subscribed when a message is
/// published; there is no ordering across topics.
#[async_trait]
pub trait Backplane: Send + Sync + 'static {
    /// Publish `payload` on `topic`, returning how many subscribers it reached
    async fn publish(&self, topic: &str, payload: Bytes) -> RealtimeResult<usize>;

    /// Subscribe `handler` to `topic`. Messages published after this returns are delivered.
    async fn subscribe(&self, topic: &str, handler: BackplaneHandler)
        -> RealtimeResult<Subscription>;
}
