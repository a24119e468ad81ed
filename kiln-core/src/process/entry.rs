//! A single interactive process and its attachable standard IO.

use crate::engine::{Container, ContainerProcess, ProcessIo, ProcessSpec, WinSize};
use crate::error::{KilnError, Result};
use crate::invoke::InvokeConfig;
use crate::ioset::{pipe, IoSet, SingleForwarder, SourceClosed, SourceEnd};
use crate::result::ResultSession;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::io::DuplexStream;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

/// Lifecycle state of an interactive process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Snapshot of a tracked process for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Caller-chosen process id.
    pub pid: String,
    /// Resolved argument vector.
    pub args: Vec<String>,
    pub tty: bool,
    pub status: ProcessStatus,
    /// Whether a caller is currently attached.
    pub attached: bool,
    pub started_at: SystemTime,
}

/// Handle to one attachment of caller IO to a process.
///
/// The token fires when the attachment is revoked: a newer attachment
/// replaced it, the caller's stdin ended, or the process was deleted.
#[derive(Debug, Clone)]
pub struct Attachment {
    id: u64,
    token: CancellationToken,
}

impl Attachment {
    pub fn revoked(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_revoked(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Interactive process running in a container built from a result session.
pub struct Process {
    pid: String,
    spec: ProcessSpec,
    session: Arc<ResultSession>,
    handle: Arc<dyn ContainerProcess>,
    stdin: Arc<SingleForwarder>,
    stdout: SingleForwarder,
    stderr: SingleForwarder,
    unbound: Mutex<Option<UnboundOutputs>>,
    attachment: Mutex<Option<Attachment>>,
    next_attachment: AtomicU64,
    status: watch::Receiver<ProcessStatus>,
    cancel: CancellationToken,
    started_at: SystemTime,
}

impl Process {
    /// Create a container for `config` on `session` and start the process in it.
    ///
    /// The container is released when the session closes.
    pub(crate) async fn start(
        pid: &str,
        session: Arc<ResultSession>,
        config: &InvokeConfig,
        buffer_size: usize,
    ) -> Result<Arc<Self>> {
        let request = session.container_request(config).await?;
        let spec = session.process_spec(config)?;

        let container: Arc<dyn Container> =
            Arc::from(session.engine_session().new_container(request).await?);
        let releaser = Arc::clone(&container);
        let owner = pid.to_string();
        let registered = session.register_cleanup(move || async move {
            if let Err(e) = releaser.release().await {
                warn!(pid = %owner, error = %e, "failed to release container");
            }
        });
        if let Err(e) = registered {
            if let Err(release_err) = container.release().await {
                warn!(pid = %pid, error = %release_err, "failed to release container");
            }
            return Err(e);
        }

        let (stdin_w, stdin_r) = pipe(buffer_size);
        let (stdout_w, stdout_r) = pipe(buffer_size);
        let (stderr_w, stderr_r) = pipe(buffer_size);
        let io = ProcessIo {
            stdin: Box::new(stdin_r),
            stdout: Box::new(stdout_w),
            stderr: Box::new(stderr_w),
        };

        let handle: Arc<dyn ContainerProcess> = Arc::from(container.start(spec.clone(), io).await?);

        let stdin = Arc::new(SingleForwarder::with_capacity(buffer_size).keep_writer_on_eof());
        stdin.set_writer(stdin_w, None).await;
        let (bound_tx, bound_rx) = oneshot::channel();
        let unbound = UnboundOutputs { stdout: stdout_r, stderr: stderr_r, bound: bound_tx };

        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let cancel = CancellationToken::new();

        tokio::spawn(supervise(
            pid.to_string(),
            Arc::clone(&handle),
            Arc::clone(&session),
            Arc::clone(&stdin),
            cancel.clone(),
            bound_rx,
            status_tx,
        ));

        info!(pid = %pid, args = ?spec.args, "started interactive process");

        Ok(Arc::new(Self {
            pid: pid.to_string(),
            spec,
            session,
            handle,
            stdin,
            stdout: SingleForwarder::with_capacity(buffer_size),
            stderr: SingleForwarder::with_capacity(buffer_size),
            unbound: Mutex::new(Some(unbound)),
            attachment: Mutex::new(None),
            next_attachment: AtomicU64::new(1),
            status: status_rx,
            cancel,
            started_at: SystemTime::now(),
        }))
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Session this process was created from.
    pub fn session(&self) -> &Arc<ResultSession> {
        &self.session
    }

    /// Attach caller streams, revoking the previous attachment.
    ///
    /// The previous attachment's writers are dropped before the new ones
    /// receive any output.
    pub async fn forward_io(self: &Arc<Self>, io: IoSet) -> Attachment {
        let attachment = Attachment {
            id: self.next_attachment.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        if let Some(previous) = lock(&self.attachment).replace(attachment.clone()) {
            debug!(pid = %self.pid, "replacing attachment");
            previous.token.cancel();
        }

        match io.stdout {
            Some(writer) => self.stdout.set_writer(writer, None).await,
            None => self.stdout.clear_writer().await,
        }
        match io.stderr {
            Some(writer) => self.stderr.set_writer(writer, None).await,
            None => self.stderr.clear_writer().await,
        }

        // Output stays in the process pipes until the first attachment.
        let unbound = lock(&self.unbound).take();
        if let Some(unbound) = unbound {
            let stdout_done = self.stdout.set_source(unbound.stdout).await;
            let stderr_done = self.stderr.set_source(unbound.stderr).await;
            let _ = unbound.bound.send([stdout_done, stderr_done]);
        }

        match io.stdin {
            Some(_) if self.status().is_terminal() => {
                debug!(pid = %self.pid, "process already finished, not reading caller stdin");
                self.stdin.clear_source();
            }
            Some(reader) => {
                let closed = self.stdin.set_source(reader).await;
                self.watch_stdin(attachment.clone(), closed);
            }
            None => self.stdin.clear_source(),
        }

        attachment
    }

    /// Detach caller streams if `attachment` is still the current one.
    pub async fn detach(&self, attachment: &Attachment) {
        let current = {
            let mut slot = lock(&self.attachment);
            match slot.as_ref() {
                Some(a) if a.id == attachment.id => slot.take(),
                _ => None,
            }
        };
        if let Some(current) = current {
            self.release_io(current).await;
        }
    }

    /// Detach whatever is currently attached.
    pub async fn detach_current(&self) {
        let current = lock(&self.attachment).take();
        if let Some(current) = current {
            self.release_io(current).await;
        }
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.attachment).is_some()
    }

    /// Current status.
    pub fn status(&self) -> ProcessStatus {
        self.status.borrow().clone()
    }

    /// Wait for the process to reach a terminal state.
    pub async fn wait(&self) -> Result<()> {
        let mut status = self.status.clone();
        let terminal = status
            .wait_for(ProcessStatus::is_terminal)
            .await
            .map_err(|_| KilnError::Internal(format!("process {} supervisor went away", self.pid)))?
            .clone();

        match terminal {
            ProcessStatus::Succeeded | ProcessStatus::Running => Ok(()),
            ProcessStatus::Failed { reason } => {
                Err(KilnError::ProcessFailed { pid: self.pid.clone(), reason })
            }
            ProcessStatus::Cancelled => Err(KilnError::Cancelled),
        }
    }

    /// Stop the process. Its status becomes [`ProcessStatus::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resize the process terminal. No-op for processes without a tty.
    pub async fn resize(&self, size: WinSize) -> Result<()> {
        if !self.spec.tty {
            debug!(pid = %self.pid, "ignoring resize for process without tty");
            return Ok(());
        }
        self.handle.resize(size).await?;
        Ok(())
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid.clone(),
            args: self.spec.args.clone(),
            tty: self.spec.tty,
            status: self.status(),
            attached: self.is_attached(),
            started_at: self.started_at,
        }
    }

    fn watch_stdin(self: &Arc<Self>, attachment: Attachment, closed: SourceClosed) {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                end = closed => {
                    if end != SourceEnd::Replaced {
                        debug!(pid = %process.pid, ?end, "caller stdin ended, detaching");
                        process.detach(&attachment).await;
                    }
                }
                _ = attachment.revoked() => {}
            }
        });
    }

    async fn release_io(&self, attachment: Attachment) {
        attachment.token.cancel();
        self.stdin.clear_source();
        self.stdout.clear_writer().await;
        self.stderr.clear_writer().await;
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(attachment) = lock(&self.attachment).take() {
            attachment.token.cancel();
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn supervise(
    pid: String,
    handle: Arc<dyn ContainerProcess>,
    session: Arc<ResultSession>,
    stdin: Arc<SingleForwarder>,
    cancel: CancellationToken,
    mut outputs: oneshot::Receiver<[SourceClosed; 2]>,
    status: watch::Sender<ProcessStatus>,
) {
    let outcome = tokio::select! {
        res = handle.wait() => match res {
            Ok(()) => ProcessStatus::Succeeded,
            Err(e) => ProcessStatus::Failed { reason: e.to_string() },
        },
        _ = cancel.cancelled() => ProcessStatus::Cancelled,
        _ = session.cancelled() => ProcessStatus::Cancelled,
    };

    if outcome == ProcessStatus::Cancelled {
        if let Err(e) = handle.kill().await {
            warn!(pid = %pid, error = %e, "failed to kill process");
        }
    } else if let Ok([stdout, stderr]) = outputs.try_recv() {
        // Deliver any output still buffered in the pipes.
        tokio::select! {
            _ = futures::future::join(stdout, stderr) => {}
            _ = cancel.cancelled() => {}
        }
    }

    stdin.close().await;
    info!(pid = %pid, status = %outcome, "interactive process finished");
    status.send_replace(outcome);
}

/// Process-side output pipes not yet wired to a forwarder.
struct UnboundOutputs {
    stdout: DuplexStream,
    stderr: DuplexStream,
    bound: oneshot::Sender<[SourceClosed; 2]>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
