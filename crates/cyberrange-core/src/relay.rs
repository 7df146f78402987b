//! Output relay: worker stdout/stderr onto the bus, and back out to viewers.
//!
//! [`OutputRelay::attach`] starts one pump task per worker stream. Each pump
//! reads lines and publishes them on the session's stdout or stderr channel
//! until the stream closes or the session is detached.
//!
//! [`OutputRelay::subscribe`] gives each caller an independent stream of
//! [`TaggedLine`]s published after the call. Delivery is at most once: if the
//! bus subscription drops, the relay resubscribes, and lines published in
//! between are lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cyberrange_types::{ChannelBinding, OutputStream, SessionId, TaggedLine};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{MessageBus, MessageStream};
use crate::error::BusError;
use crate::supervisor::OutputReader;

/// Lines buffered per subscriber before the forwarders wait on it.
const SUBSCRIBER_BUFFER: usize = 256;

/// Default delay before resubscribing after a lost subscription.
const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Stream of output lines handed to a subscriber.
pub type OutputLines = BoxStream<'static, TaggedLine>;

/// Tees worker output onto the bus and fans it out to subscribers.
pub struct OutputRelay {
    bus: Arc<dyn MessageBus>,
    pumps: Mutex<HashMap<SessionId, Vec<JoinHandle<()>>>>,
    resubscribe_delay: Duration,
}

impl std::fmt::Debug for OutputRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRelay")
            .field("resubscribe_delay", &self.resubscribe_delay)
            .finish_non_exhaustive()
    }
}

impl OutputRelay {
    /// Create a relay over `bus`.
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self::with_resubscribe_delay(bus, DEFAULT_RESUBSCRIBE_DELAY)
    }

    /// Create a relay that waits `delay` before each resubscription attempt.
    pub fn with_resubscribe_delay(bus: Arc<dyn MessageBus>, delay: Duration) -> Self {
        Self {
            bus,
            pumps: Mutex::new(HashMap::new()),
            resubscribe_delay: delay,
        }
    }

    /// Start relaying a worker's output streams.
    pub fn attach(
        &self,
        session_id: SessionId,
        stdout: Option<OutputReader>,
        stderr: Option<OutputReader>,
    ) {
        let binding = ChannelBinding::for_session(session_id);
        let pumps: Vec<_> = [(OutputStream::Stdout, stdout), (OutputStream::Stderr, stderr)]
            .into_iter()
            .filter_map(|(stream, reader)| {
                let reader = reader?;
                let channel = binding.output(stream).to_owned();
                Some(tokio::spawn(pump(
                    Arc::clone(&self.bus),
                    session_id,
                    stream,
                    channel,
                    reader,
                )))
            })
            .collect();

        let replaced = self
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, pumps);
        for old in replaced.into_iter().flatten() {
            old.abort();
        }
    }

    /// Stop relaying a session's output.
    pub fn detach(&self, session_id: SessionId) {
        let pumps = self
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
        for pump in pumps.into_iter().flatten() {
            pump.abort();
        }
    }

    /// Whether any output stream of the session is still being relayed.
    pub fn is_attached(&self, session_id: SessionId) -> bool {
        self.pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .is_some_and(|pumps| pumps.iter().any(|p| !p.is_finished()))
    }

    /// Subscribe to a session's output. Lines published after this returns
    /// are delivered; stdout and stderr are interleaved by arrival. The
    /// stream stays open across bus reconnects and ends only when dropped.
    pub async fn subscribe(&self, session_id: SessionId) -> Result<OutputLines, BusError> {
        let binding = ChannelBinding::for_session(session_id);
        let stdout = self.bus.subscribe(&binding.stdout).await?;
        let stderr = self.bus.subscribe(&binding.stderr).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        for (stream, channel, messages) in [
            (OutputStream::Stdout, binding.stdout, stdout),
            (OutputStream::Stderr, binding.stderr, stderr),
        ] {
            tokio::spawn(forward(
                Arc::clone(&self.bus),
                stream,
                channel,
                messages,
                tx.clone(),
                self.resubscribe_delay,
            ));
        }

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|line| (line, rx))
        })))
    }
}

impl Drop for OutputRelay {
    fn drop(&mut self) {
        let pumps = std::mem::take(self.pumps.get_mut().unwrap_or_else(PoisonError::into_inner));
        for pump in pumps.into_values().flatten() {
            pump.abort();
        }
    }
}

/// Publish every line of `reader` on `channel`.
async fn pump(
    bus: Arc<dyn MessageBus>,
    session_id: SessionId,
    stream: OutputStream,
    channel: String,
    reader: OutputReader,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::trace!(session_id = %session_id, stream = stream.as_str(), %line, "worker output");
                if let Err(e) = bus.publish(&channel, &line).await {
                    tracing::warn!(session_id = %session_id, stream = stream.as_str(), error = %e, "output line dropped");
                }
            }
            Ok(None) => {
                tracing::debug!(session_id = %session_id, stream = stream.as_str(), "worker stream closed");
                return;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, stream = stream.as_str(), error = %e, "worker stream read failed");
                return;
            }
        }
    }
}

/// Forward one channel to a subscriber, resubscribing whenever the bus
/// subscription ends. Returns once the subscriber is gone.
async fn forward(
    bus: Arc<dyn MessageBus>,
    stream: OutputStream,
    channel: String,
    mut messages: MessageStream,
    tx: mpsc::Sender<TaggedLine>,
    resubscribe_delay: Duration,
) {
    loop {
        loop {
            let next = tokio::select! {
                () = tx.closed() => return,
                next = messages.next() => next,
            };
            let Some(line) = next else { break };
            if tx.send(TaggedLine { stream, line }).await.is_err() {
                return;
            }
        }

        tracing::warn!(channel = %channel, "output subscription lost, resubscribing; lines published meanwhile are lost");
        messages = loop {
            tokio::select! {
                () = tx.closed() => return,
                () = tokio::time::sleep(resubscribe_delay) => {}
            }
            match bus.subscribe(&channel).await {
                Ok(messages) => break messages,
                Err(e) => tracing::warn!(channel = %channel, error = %e, "resubscribe failed"),
            }
        };
        tracing::info!(channel = %channel, "output subscription restored");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::bus::MemoryBus;

    async fn wait_for_subscribers(bus: &MemoryBus, channel: &str, count: usize) {
        for _ in 0..500 {
            if bus.subscriber_count(channel) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn take(lines: &mut OutputLines, n: usize) -> Vec<TaggedLine> {
        let mut out = Vec::new();
        for _ in 0..n {
            let next = tokio::time::timeout(Duration::from_secs(5), lines.next()).await;
            out.push(next.unwrap().unwrap());
        }
        out
    }

    fn stdout(line: &str) -> TaggedLine {
        TaggedLine {
            stream: OutputStream::Stdout,
            line: line.to_owned(),
        }
    }

    #[tokio::test]
    async fn two_subscribers_see_the_same_lines_in_order() {
        let bus = MemoryBus::new();
        let relay = OutputRelay::new(Arc::new(bus.clone()));
        let session = SessionId::new();
        let binding = ChannelBinding::for_session(session);

        let mut first = relay.subscribe(session).await.unwrap();
        let mut second = relay.subscribe(session).await.unwrap();

        for line in ["alpha", "beta", "gamma"] {
            bus.publish(&binding.stdout, line).await.unwrap();
        }

        let expected = vec![stdout("alpha"), stdout("beta"), stdout("gamma")];
        assert_eq!(take(&mut first, 3).await, expected);
        assert_eq!(take(&mut second, 3).await, expected);
    }

    #[tokio::test]
    async fn attached_worker_output_reaches_subscribers_tagged() {
        let bus = MemoryBus::new();
        let relay = OutputRelay::new(Arc::new(bus.clone()));
        let session = SessionId::new();
        let mut lines = relay.subscribe(session).await.unwrap();

        relay.attach(
            session,
            Some(Box::new(Cursor::new(b"one\ntwo\n".to_vec()))),
            Some(Box::new(Cursor::new(b"oops\n".to_vec()))),
        );

        let mut got = take(&mut lines, 3).await;
        let stderr: Vec<_> = got.iter().filter(|l| l.stream == OutputStream::Stderr).cloned().collect();
        got.retain(|l| l.stream == OutputStream::Stdout);
        assert_eq!(got, vec![stdout("one"), stdout("two")]);
        assert_eq!(stderr.first().map(ToString::to_string).as_deref(), Some("STDERR: oops"));
    }

    #[tokio::test]
    async fn subscription_survives_a_bus_disconnect() {
        let bus = MemoryBus::new();
        let relay = OutputRelay::with_resubscribe_delay(Arc::new(bus.clone()), Duration::from_millis(5));
        let session = SessionId::new();
        let binding = ChannelBinding::for_session(session);
        let mut lines = relay.subscribe(session).await.unwrap();

        bus.publish(&binding.stdout, "before").await.unwrap();
        assert_eq!(take(&mut lines, 1).await, vec![stdout("before")]);

        bus.disconnect_subscribers();
        wait_for_subscribers(&bus, &binding.stdout, 1).await;

        bus.publish(&binding.stdout, "after").await.unwrap();
        assert_eq!(take(&mut lines, 1).await, vec![stdout("after")]);
    }

    #[tokio::test]
    async fn dropping_the_subscriber_releases_bus_subscriptions() {
        let bus = MemoryBus::new();
        let relay = OutputRelay::new(Arc::new(bus.clone()));
        let session = SessionId::new();
        let binding = ChannelBinding::for_session(session);

        let lines = relay.subscribe(session).await.unwrap();
        assert_eq!(bus.subscriber_count(&binding.stdout), 1);
        drop(lines);

        for _ in 0..500 {
            if bus.subscriber_count(&binding.stdout) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(bus.subscriber_count(&binding.stdout), 0);
    }

    #[tokio::test]
    async fn detach_stops_pumps() {
        let bus = MemoryBus::new();
        let relay = OutputRelay::new(Arc::new(bus.clone()));
        let session = SessionId::new();
        let (_writer, reader) = tokio::io::duplex(64);

        relay.attach(session, Some(Box::new(reader)), None);
        assert!(relay.is_attached(session));
        relay.detach(session);
        assert!(!relay.is_attached(session));
    }
}
