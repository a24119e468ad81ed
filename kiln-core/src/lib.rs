//! Kiln Core Library
//!
//! Interactive build/debug sessions on top of a remote build engine: capture a
//! build's outcome, keep its engine session open, and run interactive
//! processes in containers reconstructed from it.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod invoke;
pub mod ioset;
pub mod metadata;
pub mod observability;
pub mod paths;
pub mod process;
pub mod result;
pub mod status;

// Re-export commonly used items
pub use config::Config;
pub use controller::{run::run_build, BuildController, BuildOutcome};
pub use engine::{BuildRequest, Engine, EngineSession};
pub use error::{EngineError, KilnError, Result};
pub use invoke::{InvokeConfig, InvokeMode, InvokeRequest};
pub use ioset::{IoSet, SingleForwarder};
pub use observability::init as init_observability;
pub use process::{Process, ProcessInfo, ProcessManager, ProcessStatus};
pub use result::{Outcome, ResultSession};
