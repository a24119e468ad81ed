//! Build status events and the best-effort relay that forwards them.
//!
//! The engine pushes events into a bounded channel. A relay task drains that
//! channel and forwards each event to an optional progress sink with
//! `try_send`, so a slow or absent consumer drops events instead of stalling
//! the engine. The relay is scoped by a [`CancellationToken`]: dropping the
//! returned [`RelayGuard`] stops it, and it never forwards afterwards.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

/// Sending half used by the engine.
pub type StatusSender = mpsc::Sender<StatusEvent>;

/// Receiving half drained by the relay or a progress printer.
pub type StatusReceiver = mpsc::Receiver<StatusEvent>;

/// Create a bounded status channel.
pub fn channel(capacity: usize) -> (StatusSender, StatusReceiver) {
    mpsc::channel(capacity.max(1))
}

/// State of a build vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum VertexState {
    Started,
    Cached,
    Completed,
    Errored { message: String },
}

/// One progress update from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Digest of the vertex this event belongs to.
    pub vertex: String,
    /// Human readable vertex name (e.g. `[2/4] RUN make`).
    pub name: String,
    #[serde(flatten)]
    pub state: VertexState,
    /// Log output emitted by the vertex, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<u8>,
    pub timestamp: SystemTime,
}

impl StatusEvent {
    pub fn new(vertex: impl Into<String>, name: impl Into<String>, state: VertexState) -> Self {
        Self {
            vertex: vertex.into(),
            name: name.into(),
            state,
            logs: Vec::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_logs(mut self, logs: impl Into<Vec<u8>>) -> Self {
        self.logs = logs.into();
        self
    }
}

/// Handle to a running relay. Dropping it stops the relay.
pub struct RelayGuard {
    _guard: DropGuard,
    handle: JoinHandle<RelayStats>,
}

impl RelayGuard {
    /// Stop the relay and wait for it to exit.
    pub async fn finish(self) -> RelayStats {
        let RelayGuard { _guard, handle } = self;
        drop(_guard);
        handle.await.unwrap_or_default()
    }
}

/// Counters collected by a relay over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub forwarded: u64,
    pub dropped: u64,
}

/// Spawn a relay from `source` to `sink`, scoped by a child of `parent`.
///
/// With no sink every event is drained and discarded.
pub fn spawn_relay(
    mut source: StatusReceiver,
    sink: Option<StatusSender>,
    parent: &CancellationToken,
) -> RelayGuard {
    let token = parent.child_token();
    let scope = token.clone();

    let handle = tokio::spawn(async move {
        let mut stats = RelayStats::default();
        let mut sink = sink;

        loop {
            let event = tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                event = source.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let Some(tx) = sink.as_ref() else {
                stats.dropped += 1;
                continue;
            };

            match tx.try_send(event) {
                Ok(()) => stats.forwarded += 1,
                Err(TrySendError::Full(_)) => {
                    trace!("progress sink full, dropping status event");
                    stats.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("progress sink closed, discarding further status events");
                    stats.dropped += 1;
                    sink = None;
                }
            }
        }

        stats
    });

    RelayGuard { _guard: token.drop_guard(), handle }
}
