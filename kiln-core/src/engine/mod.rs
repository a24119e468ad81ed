//! Build engine abstraction.
//!
//! Kiln never talks to a build engine directly. Engine clients implement the
//! traits in this module:
//! - [`Engine`]: submits builds and opens long-lived sessions
//! - [`EngineSession`]: evaluates definitions and materializes containers
//! - [`Container`] / [`ContainerProcess`]: run interactive processes

mod types;

pub use types::*;

pub use crate::error::EngineError;
use crate::ioset::{BoxReader, BoxWriter};
use crate::status::StatusSender;
use async_trait::async_trait;
use std::sync::Arc;

/// Result type for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Build engine client.
///
/// Status events are pushed into the provided sender. Implementations must
/// tolerate the receiving side going away and keep building.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Run a build to completion.
    ///
    /// `input` carries stdin-provided build input (e.g. a Dockerfile piped in).
    /// A failing step is reported as [`EngineError::Solve`], with the failing
    /// definition attached when the engine can provide it.
    async fn build(
        &self,
        request: &BuildRequest,
        input: BoxReader,
        status: StatusSender,
    ) -> EngineResult<BuildOutput>;

    /// Open a new engine session. It stays open until [`EngineSession::close`].
    async fn open_session(&self, status: StatusSender) -> EngineResult<Arc<dyn EngineSession>>;

    /// Get engine name (for logging/metrics).
    fn name(&self) -> &str;
}

/// Long-lived connection to the build engine.
#[async_trait]
pub trait EngineSession: Send + Sync {
    /// Evaluate a definition.
    ///
    /// A step-level failure is returned as [`EngineError::Solve`].
    async fn solve(&self, request: SolveRequest) -> EngineResult<SolveResult>;

    /// Materialize a container from resolved mounts.
    async fn new_container(&self, request: ContainerRequest) -> EngineResult<Box<dyn Container>>;

    /// Close the session. Must be safe to call more than once.
    async fn close(&self);
}

/// Container materialized on an engine session.
#[async_trait]
pub trait Container: Send + Sync {
    /// Start a process in the container.
    ///
    /// The process owns `io` and drops it when it exits, so its stdout and
    /// stderr readers observe end-of-stream.
    async fn start(&self, spec: ProcessSpec, io: ProcessIo) -> EngineResult<Box<dyn ContainerProcess>>;

    /// Release the container's resources.
    async fn release(&self) -> EngineResult<()>;
}

/// Process running inside a [`Container`].
#[async_trait]
pub trait ContainerProcess: Send + Sync {
    /// Wait for the process to exit. Non-zero exit is [`EngineError::Exit`].
    async fn wait(&self) -> EngineResult<()>;

    /// Kill the process.
    async fn kill(&self) -> EngineResult<()>;

    /// Resize the process terminal.
    async fn resize(&self, size: WinSize) -> EngineResult<()>;
}

/// Process-side standard streams handed to [`Container::start`].
pub struct ProcessIo {
    pub stdin: BoxReader,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo").finish_non_exhaustive()
    }
}
