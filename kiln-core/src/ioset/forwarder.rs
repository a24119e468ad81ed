//! Rebindable single-producer/single-consumer byte relay.

use super::{BoxReader, BoxWriter, DEFAULT_PIPE_CAPACITY};
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Hook receiving the previous writer when it is replaced.
pub type ReplaceHook = Box<dyn FnOnce(BoxWriter) -> BoxFuture<'static, ()> + Send>;

/// Hook that shuts the replaced writer down so its reader sees end-of-stream.
pub fn close_on_replace() -> ReplaceHook {
    Box::new(|mut writer: BoxWriter| {
        Box::pin(async move {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "failed to close replaced writer");
            }
        })
    })
}

/// Why a forwarder source stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEnd {
    /// The source reached end-of-stream.
    Eof,
    /// Reading from the source failed.
    Failed,
    /// A newer source was installed, or the forwarder was closed.
    Replaced,
}

/// Resolves when the source passed to [`SingleForwarder::set_source`] stops.
pub struct SourceClosed(oneshot::Receiver<SourceEnd>);

impl Future for SourceClosed {
    type Output = SourceEnd;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|end| end.unwrap_or(SourceEnd::Replaced))
    }
}

struct Sink {
    writer: BoxWriter,
    on_replaced: Option<ReplaceHook>,
}

impl Sink {
    async fn retire(self) {
        match self.on_replaced {
            Some(hook) => hook(self.writer).await,
            None => drop(self.writer),
        }
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "failed to close writer after source end");
        }
    }
}

#[derive(Default)]
struct State {
    sink: Option<Sink>,
    /// The source hit end-of-stream and writers are closed on arrival.
    exhausted: bool,
}

#[derive(Default)]
struct Shared {
    state: tokio::sync::Mutex<State>,
    /// Fires when the current sink is being replaced, aborting a blocked write.
    revoke: Mutex<CancellationToken>,
}

impl Shared {
    fn revoke_token(&self) -> CancellationToken {
        lock(&self.revoke).clone()
    }

    async fn write(&self, chunk: &[u8]) {
        loop {
            let mut state = self.state.lock().await;
            let revoked = self.revoke_token();
            if revoked.is_cancelled() {
                // A replacement is queued on the state lock; let it install first.
                drop(state);
                tokio::task::yield_now().await;
                continue;
            }

            let Some(sink) = state.sink.as_mut() else {
                trace!(len = chunk.len(), "no writer attached, dropping chunk");
                return;
            };

            let written = tokio::select! {
                biased;
                _ = revoked.cancelled() => {
                    trace!("writer replaced mid-chunk");
                    return;
                }
                res = async {
                    sink.writer.write_all(chunk).await?;
                    sink.writer.flush().await
                } => res,
            };

            if let Err(e) = written {
                debug!(error = %e, "failed to forward chunk");
            }
            return;
        }
    }

    async fn exhaust(&self) {
        let mut state = self.state.lock().await;
        state.exhausted = true;
        if let Some(sink) = state.sink.take() {
            sink.shutdown().await;
        }
    }
}

/// Relays bytes from one source to one replaceable writer.
///
/// Replacing the writer hands the previous one to its `on_replaced` hook
/// before the new writer receives any byte, and no chunk is delivered to two
/// writers. Chunks read while no writer is installed are dropped.
pub struct SingleForwarder {
    shared: Arc<Shared>,
    source: Mutex<Option<CancellationToken>>,
    capacity: usize,
    keep_writer_on_eof: bool,
}

impl SingleForwarder {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Forwarder reading in chunks of up to `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            source: Mutex::new(None),
            capacity: capacity.max(1),
            keep_writer_on_eof: false,
        }
    }

    /// Keep the writer open when the source ends instead of shutting it down.
    ///
    /// Used for process stdin, where one caller detaching must not close the
    /// process's input.
    pub fn keep_writer_on_eof(mut self) -> Self {
        self.keep_writer_on_eof = true;
        self
    }

    /// Install a new source, stopping the previous one.
    pub async fn set_source<R>(&self, reader: R) -> SourceClosed
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.source).replace(token.clone()) {
            previous.cancel();
        }

        self.shared.state.lock().await.exhausted = false;

        let (done_tx, done_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let capacity = self.capacity;
        let keep_writer = self.keep_writer_on_eof;
        let mut reader: BoxReader = Box::new(reader);

        tokio::spawn(async move {
            let mut buf = vec![0u8; capacity];
            let end = loop {
                let n = tokio::select! {
                    biased;
                    _ = token.cancelled() => break SourceEnd::Replaced,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => break SourceEnd::Eof,
                        Ok(n) => n,
                        Err(e) => {
                            debug!(error = %e, "forwarder source failed");
                            break SourceEnd::Failed;
                        }
                    },
                };
                shared.write(&buf[..n]).await;
            };

            if end != SourceEnd::Replaced && !keep_writer {
                shared.exhaust().await;
            }
            let _ = done_tx.send(end);
        });

        SourceClosed(done_rx)
    }

    /// Stop the current source without installing a new one.
    pub fn clear_source(&self) {
        if let Some(previous) = lock(&self.source).take() {
            previous.cancel();
        }
    }

    /// Replace the writer.
    ///
    /// The previous writer is passed to its own `on_replaced` hook, or dropped
    /// when it has none. If the source is already exhausted the new writer is
    /// shut down immediately.
    pub async fn set_writer<W>(&self, writer: W, on_replaced: Option<ReplaceHook>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.install(Some(Sink { writer: Box::new(writer), on_replaced })).await;
    }

    /// Remove the writer, retiring it like a replacement.
    pub async fn clear_writer(&self) {
        self.install(None).await;
    }

    /// Whether a writer is currently installed.
    pub async fn has_writer(&self) -> bool {
        self.shared.state.lock().await.sink.is_some()
    }

    /// Stop the source and retire the writer.
    pub async fn close(&self) {
        self.clear_source();
        self.clear_writer().await;
    }

    async fn install(&self, sink: Option<Sink>) {
        self.shared.revoke_token().cancel();

        let mut state = self.shared.state.lock().await;
        if let Some(previous) = state.sink.take() {
            previous.retire().await;
        }
        *lock(&self.shared.revoke) = CancellationToken::new();

        match sink {
            Some(sink) if state.exhausted => sink.shutdown().await,
            sink => state.sink = sink,
        }
    }
}

impl Default for SingleForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SingleForwarder {
    fn drop(&mut self) {
        self.clear_source();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
