//! Error types for Kiln.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Failures reported by the build engine are kept in their own [`EngineError`]
//! type so they can be wrapped and propagated verbatim.

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::{Definition, StepError};

/// Result type alias for Kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for Kiln.
#[derive(Error, Debug)]
pub enum KilnError {
    // Controller errors
    #[error("build ongoing")]
    BuildOngoing,

    #[error("unknown ref {reference:?}")]
    UnknownRef { reference: String },

    #[error("no build result is registered")]
    NoBuildResult,

    #[error("io cancelled")]
    IoCancelled,

    #[error("operation cancelled")]
    Cancelled,

    // Process errors
    #[error("unknown process {pid:?}")]
    UnknownProcess { pid: String },

    #[error("process {pid:?} already exists")]
    ProcessExists { pid: String },

    #[error("process {pid:?} failed: {reason}")]
    ProcessFailed { pid: String, reason: String },

    // Reconstruction errors
    #[error("unsupported step kind {kind:?}: only exec steps can be invoked")]
    UnsupportedStep { kind: String },

    #[error("invalid image config: {source}")]
    InvalidImageConfig {
        #[source]
        source: serde_json::Error,
    },

    #[error("no reference is registered in the build result")]
    MissingReference,

    #[error(
        "starting a container from the initial state of the step is supported only on failed steps"
    )]
    InitialStateOnSuccess,

    #[error("malformed step error: {reason}")]
    MalformedStepError { reason: String },

    #[error("result session is already closed")]
    SessionClosed,

    // Engine errors
    #[error(transparent)]
    Engine(#[from] EngineError),

    // Configuration errors
    #[error("invalid invoke config: {reason}")]
    InvalidInvokeConfig { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Create an invoke-config error from a displayable reason.
    pub(crate) fn invoke_config(reason: impl Into<String>) -> Self {
        Self::InvalidInvokeConfig { reason: reason.into() }
    }

    /// Whether the error came from the caller cancelling the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors reported by the build engine collaborator.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A build step failed. Carries enough structure to rebuild the step's
    /// environment, and the definition that was being evaluated when known.
    #[error("{error}")]
    Solve { error: Box<StepError>, definition: Option<Definition> },

    /// A process exited with a non-zero status.
    #[error("process exited with code {code}")]
    Exit { code: i32 },

    /// The engine session or connection went away.
    #[error("engine session closed")]
    SessionClosed,

    /// Any other failure from the engine.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Build a step-level failure.
    pub fn solve(error: StepError, definition: Option<Definition>) -> Self {
        Self::Solve { error: Box::new(error), definition }
    }

    /// Borrow the captured step failure, if this is one.
    pub fn step_error(&self) -> Option<&StepError> {
        match self {
            Self::Solve { error, .. } => Some(error),
            _ => None,
        }
    }
}
