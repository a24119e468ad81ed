//! Standard IO plumbing for interactive processes.
//!
//! [`IoSet`] is the caller's side of an attachment: its terminal or socket
//! streams. [`SingleForwarder`] relays bytes from one source to one
//! replaceable writer so a process can be reattached without the process
//! noticing.

mod forwarder;

pub use forwarder::{close_on_replace, ReplaceHook, SingleForwarder, SourceClosed, SourceEnd};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

/// Boxed byte source.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed byte sink.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default capacity of in-memory pipes.
pub const DEFAULT_PIPE_CAPACITY: usize = 32 * 1024;

/// Create an in-memory unidirectional pipe of the given capacity.
///
/// Dropping or shutting down the writer makes the reader observe end-of-stream.
pub fn pipe(capacity: usize) -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(capacity.max(1))
}

/// Caller-side streams for one attachment.
pub struct IoSet {
    pub stdin: Option<BoxReader>,
    pub stdout: Option<BoxWriter>,
    pub stderr: Option<BoxWriter>,
}

impl IoSet {
    pub fn new<R, O, E>(stdin: R, stdout: O, stderr: E) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        Self { stdin: Some(Box::new(stdin)), stdout: Some(Box::new(stdout)), stderr: Some(Box::new(stderr)) }
    }

    /// Attachment with no streams at all.
    pub fn empty() -> Self {
        Self { stdin: None, stdout: None, stderr: None }
    }

    /// Attach to the current process's own standard streams.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr())
    }
}

impl std::fmt::Debug for IoSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSet")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}
