//! In-process backplane

use super::backplane::{Backplane, BackplaneHandler, Subscription};
use crate::error::RealtimeResult;
use async_trait::async_trait;
use axum::body::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

struct Subscriber {
    id: u64,
    cancellation: CancellationToken,
    sender: mpsc::Sender<Bytes>,
}

type TopicMap = DashMap<String, Vec<Subscriber>>;

/// Backplane over per-subscription bounded queues.
///
/// Several hub lifetime managers sharing one instance behave like servers
/// sharing a pub/sub product. Each subscription gets its own task, so a
/// subscriber sees a topic's messages in publish order. A subscription stops
/// counting as a receiver the moment it is cancelled; messages queued before
/// that are still handed to its handler.
pub struct MemoryBackplane {
    topics: Arc<TopicMap>,
    capacity: usize,
    next_id: AtomicU64,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|subscriber| !subscriber.cancellation.is_cancelled())
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn publish(&self, topic: &str, payload: Bytes) -> RealtimeResult<usize> {
        // The shard read lock is held for the whole fan-out; a finishing
        // subscription takes the write lock before draining its queue.
        let Some(subscribers) = self.topics.get(topic) else {
            return Ok(0);
        };

        let mut reached = 0;
        for subscriber in subscribers.iter() {
            if subscriber.cancellation.is_cancelled() {
                continue;
            }
            match subscriber.sender.try_send(payload.clone()) {
                Ok(()) => reached += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber on {} lagged, dropping message", topic)
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(reached)
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: BackplaneHandler,
    ) -> RealtimeResult<Subscription> {
        let (sender, mut receiver) = mpsc::channel(self.capacity);
        let cancellation = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                cancellation: cancellation.clone(),
                sender,
            });

        let stopped = cancellation.clone();
        let topics = self.topics.clone();
        let topic_name = topic.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    message = receiver.recv() => message,
                };
                match message {
                    Some(payload) => handler(payload).await,
                    None => break,
                }
            }

            if let Some(mut subscribers) = topics.get_mut(&topic_name) {
                subscribers.retain(|subscriber| subscriber.id != id);
            }
            topics.remove_if(&topic_name, |_, subscribers| subscribers.is_empty());

            // Publishes counted before cancellation are already queued
            receiver.close();
            while let Ok(payload) = receiver.try_recv() {
                handler(payload).await;
            }
            debug!("Subscription to {} ended", topic_name);
        });

        Ok(Subscription::new(topic.to_string(), cancellation))
    }
}
