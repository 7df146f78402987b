//! `Dragonfly` (Redis-compatible) message bus.
//!
//! `Dragonfly` carries everything exchanged between the orchestrator and a
//! session's worker. Key patterns are derived from the session id, see
//! [`ChannelBinding`](cyberrange_types::ChannelBinding).
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `session:{id}:advance` | Channel | Step trigger |
//! | `session:{id}:results` | List | JSON step results |
//! | `session:{id}:stdout` | Channel | Worker stdout lines |
//! | `session:{id}:stderr` | Channel | Worker stderr lines |
//! | `session:{id}` | Hash | Registry record (see [`session_store`](crate::session_store)) |
//! | `sessions:index` | Set | Ids of all registry records |
//!
//! Blocking pops and subscriptions each get a dedicated connection so they
//! never stall commands issued on the shared client.
//!
//! A blocking pop runs in its own task. When the caller stops waiting before
//! `BLPOP` returns, the task still owns the connection until the command
//! ends, and a value it popped for nobody goes back to the head of the list.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cyberrange_core::BusError;
use cyberrange_core::bus::{MessageBus, MessageStream};
use fred::prelude::*;
use futures::stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

use crate::error::DbError;

/// Idle blocking connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 8;

/// Pops shorter than this are issued as a non-blocking `LPOP`.
const MIN_BLOCKING_POP: Duration = Duration::from_millis(1);

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
///
/// Wraps a [`fred::prelude::Client`] for ordinary commands plus a small
/// cache of connections reserved for `BLPOP`.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
    blocking: Arc<Mutex<Vec<Client>>>,
}

impl std::fmt::Debug for DragonflyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DragonflyPool").finish_non_exhaustive()
    }
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config)
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2))
            .build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self {
            client,
            blocking: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Return a reference to the underlying [`fred`] client.
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Close the shared connection and every cached blocking connection.
    pub async fn close(&self) {
        let idle = std::mem::take(&mut *self.blocking.lock().unwrap_or_else(PoisonError::into_inner));
        for client in idle {
            let _ = client.quit().await;
        }
        let _ = self.client.quit().await;
        tracing::info!("Dragonfly connections closed");
    }

    /// A connection with the same configuration as the shared client.
    async fn dedicated(&self) -> Result<Client, DbError> {
        let client = self.client.clone_new();
        client.init().await?;
        Ok(client)
    }

    /// Take an idle blocking connection or open a new one.
    async fn checkout_blocking(&self) -> Result<Client, DbError> {
        let idle = self.blocking.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match idle {
            Some(client) if client.is_connected() => Ok(client),
            _ => self.dedicated().await,
        }
    }

    /// Return a blocking connection after a successful command.
    fn checkin_blocking(&self, client: Client) {
        let mut idle = self.blocking.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(client);
        } else {
            drop(idle);
            quit_in_background(client);
        }
    }

    // =========================================================================
    // Queues -- session:{id}:results
    // =========================================================================

    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, DbError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let pool = self.clone();
        let owned_key = key.to_owned();
        tokio::spawn(async move {
            let popped = pool.blpop_once(&owned_key, timeout).await;
            if let Err(Ok(Some(orphan))) = reply_tx.send(popped) {
                pool.requeue(&owned_key, orphan).await;
            }
        });
        reply_rx
            .await
            .map_err(|e| DbError::Aborted(format!("blocking pop on {key}: {e}")))?
    }

    /// One `BLPOP` on a blocking connection. The connection is checked back
    /// in after a reply and closed after an error.
    async fn blpop_once(&self, key: &str, timeout: Duration) -> Result<Option<String>, DbError> {
        let client = self.checkout_blocking().await?;
        // BLPOP replies with [key, value] or nil on timeout.
        let reply: Option<Vec<String>> = match client.blpop(key, timeout.as_secs_f64()).await {
            Ok(reply) => reply,
            Err(e) => {
                quit_in_background(client);
                return Err(e.into());
            }
        };
        self.checkin_blocking(client);
        Ok(reply.and_then(|pair| pair.into_iter().nth(1)))
    }

    /// Put a value popped for a caller that stopped waiting back at the head
    /// of its list.
    async fn requeue(&self, key: &str, value: String) {
        match self.client.lpush::<u64, _, _>(key, value).await {
            Ok(_) => tracing::debug!(key, "abandoned pop requeued"),
            Err(e) => tracing::error!(key, error = %e, "abandoned pop could not be requeued, value lost"),
        }
    }
}

#[async_trait]
impl MessageBus for DragonflyPool {
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BusError> {
        let receivers: u64 = self
            .client
            .publish(channel, payload)
            .await
            .map_err(DbError::from)?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BusError> {
        let subscriber = self.dedicated().await?;
        let messages = subscriber.message_rx();
        let reconnects = subscriber.reconnect_rx();
        subscriber
            .subscribe(channel)
            .await
            .map_err(DbError::from)?;
        tracing::debug!(channel, "subscribed");

        // The stream ends when the connection is re-established, since the
        // server forgot the subscription.
        let state = (messages, reconnects, ConnectionGuard(Some(subscriber)));
        Ok(Box::pin(stream::unfold(state, |(mut messages, mut reconnects, guard)| async move {
            loop {
                tokio::select! {
                    message = messages.recv() => match message {
                        Ok(message) => {
                            if let Some(payload) = message.value.as_string() {
                                return Some((payload, (messages, reconnects, guard)));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "subscriber lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    },
                    reconnect = reconnects.recv() => {
                        if !matches!(reconnect, Err(RecvError::Lagged(_))) {
                            tracing::warn!("subscription connection reset");
                            return None;
                        }
                    }
                }
            }
        })))
    }

    async fn push(&self, key: &str, payload: &str) -> Result<(), BusError> {
        let _: u64 = self.client.rpush(key, payload).await.map_err(DbError::from)?;
        Ok(())
    }

    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, BusError> {
        if timeout < MIN_BLOCKING_POP {
            let value: Option<String> = self.client.lpop(key, None).await.map_err(DbError::from)?;
            return Ok(value);
        }
        Ok(self.blocking_pop(key, timeout).await?)
    }

    async fn clear(&self, key: &str) -> Result<(), BusError> {
        let _: u32 = self.client.del(key).await.map_err(DbError::from)?;
        Ok(())
    }
}

/// Quits the subscription connection once its stream is dropped.
struct ConnectionGuard(Option<Client>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(client) = self.0.take() {
            quit_in_background(client);
        }
    }
}

/// Close a connection without waiting for it.
fn quit_in_background(client: Client) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            let _ = client.quit().await;
        });
    }
}
