//! Message bus seam: publish/subscribe channels plus list queues.
//!
//! The orchestrator and the worker never talk directly. The orchestrator
//! publishes step triggers on a channel; the worker pushes results onto a
//! list the orchestrator pops from. Output lines travel over channels.
//!
//! [`MessageBus`] abstracts the broker. The production implementation lives
//! in `cyberrange-db` (`Dragonfly` over `fred`); [`MemoryBus`] provides the
//! same semantics in-process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;

use crate::error::BusError;

/// Stream of raw messages received on one channel.
pub type MessageStream = BoxStream<'static, String>;

/// Per-channel buffer for [`MemoryBus`] subscribers. A subscriber that falls
/// further behind skips ahead and loses the oldest messages.
const CHANNEL_CAPACITY: usize = 1024;

/// Broker operations the orchestrator needs.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish `payload` on `channel`. Returns how many subscribers received
    /// it; zero means the message was dropped.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BusError>;

    /// Subscribe to `channel`. Only messages published after this call
    /// returns are delivered. The stream ends if the subscription is lost.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BusError>;

    /// Append `payload` to the list at `key`.
    async fn push(&self, key: &str, payload: &str) -> Result<(), BusError>;

    /// Remove and return the head of the list at `key`, waiting up to
    /// `timeout` for one to arrive. A zero timeout checks once without
    /// waiting.
    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, BusError>;

    /// Delete the list at `key` and anything queued on it.
    async fn clear(&self, key: &str) -> Result<(), BusError>;
}

/// In-process [`MessageBus`].
///
/// Channels are `tokio::sync::broadcast` senders created on first
/// subscription; lists are `VecDeque`s guarded by a mutex with a [`Notify`]
/// waking blocked pops. Cloning shares the same bus.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

#[derive(Debug, Default)]
struct MemoryBusInner {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of items queued at `key`.
    pub fn queue_len(&self, key: &str) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, VecDeque::len)
    }

    /// Drop every channel, ending all current subscription streams as a lost
    /// broker connection would.
    pub fn disconnect_subscribers(&self) {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn try_pop(&self, key: &str) -> Option<String> {
        let mut queues = self.inner.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.get_mut(key)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            queues.remove(key);
        }
        item
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BusError> {
        let channels = self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let delivered = channels
            .get(channel)
            .and_then(|sender| sender.send(payload.to_owned()).ok())
            .unwrap_or(0);
        Ok(u64::try_from(delivered).unwrap_or(u64::MAX))
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BusError> {
        let receiver = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let channel = channel.to_owned();

        Ok(Box::pin(futures::stream::unfold(
            (receiver, channel),
            |(mut receiver, channel)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => return Some((message, (receiver, channel))),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %channel, skipped, "subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        )))
    }

    async fn push(&self, key: &str, payload: &str) -> Result<(), BusError> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_owned())
            .or_default()
            .push_back(payload.to_owned());
        self.inner.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, BusError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Err(BusError::Command(format!("pop timeout {timeout:?} out of range")));
        };
        loop {
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            if let Some(item) = self.try_pop(key) {
                return Ok(Some(item));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(key));
            }
        }
    }

    async fn clear(&self, key: &str) -> Result<(), BusError> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = MemoryBus::new();
        assert_eq!(bus.publish("chan", "lost").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_message() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("chan").await.unwrap();
        let mut second = bus.subscribe("chan").await.unwrap();

        assert_eq!(bus.publish("chan", "a").await.unwrap(), 2);
        assert_eq!(bus.publish("chan", "b").await.unwrap(), 2);

        assert_eq!(first.next().await.as_deref(), Some("a"));
        assert_eq!(first.next().await.as_deref(), Some("b"));
        assert_eq!(second.next().await.as_deref(), Some("a"));
        assert_eq!(second.next().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn disconnect_ends_streams() {
        let bus = MemoryBus::new();
        let mut stream = bus.subscribe("chan").await.unwrap();
        bus.disconnect_subscribers();
        assert!(stream.next().await.is_none());
        assert_eq!(bus.subscriber_count("chan"), 0);
    }

    #[tokio::test]
    async fn pop_is_fifo() {
        let bus = MemoryBus::new();
        bus.push("q", "1").await.unwrap();
        bus.push("q", "2").await.unwrap();
        assert_eq!(bus.pop("q", Duration::ZERO).await.unwrap().as_deref(), Some("1"));
        assert_eq!(bus.pop("q", Duration::ZERO).await.unwrap().as_deref(), Some("2"));
        assert_eq!(bus.pop("q", Duration::ZERO).await.unwrap(), None);
        assert_eq!(bus.queue_len("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_on_empty_queue() {
        let bus = MemoryBus::new();
        let started = Instant::now();
        let popped = bus.pop("q", Duration::from_secs(3)).await.unwrap();
        assert!(popped.is_none());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_wakes_on_push() {
        let bus = MemoryBus::new();
        let producer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push("q", "late").await.unwrap();
        });

        let popped = bus.pop("q", Duration::from_secs(5)).await.unwrap();
        assert_eq!(popped.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn clear_drops_queued_items() {
        let bus = MemoryBus::new();
        bus.push("q", "stale").await.unwrap();
        bus.clear("q").await.unwrap();
        assert_eq!(bus.pop("q", Duration::ZERO).await.unwrap(), None);
    }
}
