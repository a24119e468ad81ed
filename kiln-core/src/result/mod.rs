//! Build outcome capture.
//!
//! A [`ResultSession`] owns one engine session and the outcome evaluated on
//! it: either the successful result or the failed step. The session stays
//! open so interactive containers can be created from the outcome, and is
//! torn down exactly once by [`ResultSession::close`].

mod reconstruct;

pub use crate::engine::ProcessSpec;
pub use reconstruct::{
    container_from_error, container_from_result, image_config, process_from_error,
    process_from_result, ImageConfig, ImageSpec,
};

use crate::engine::{
    ContainerRequest, Definition, Engine, EngineError, EngineSession, SolveRequest, SolveResult,
    StepError,
};
use crate::error::{KilnError, Result};
use crate::invoke::InvokeConfig;
use crate::status::{self, StatusSender};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, instrument};

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// What evaluating a definition produced.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(SolveResult),
    Failure(StepError),
}

#[derive(Default)]
struct Cleanups {
    callbacks: Vec<Cleanup>,
    closed: bool,
}

/// Owner of a still-open engine session and the outcome evaluated on it.
pub struct ResultSession {
    outcome: Outcome,
    session: Arc<dyn EngineSession>,
    cancel: CancellationToken,
    cleanups: Mutex<Cleanups>,
    teardown: OnceCell<()>,
}

impl ResultSession {
    /// Evaluate `definition` on an already open engine session.
    ///
    /// A step failure becomes the [`Outcome::Failure`] outcome. Any other error
    /// closes the engine session and is returned.
    #[instrument(skip_all)]
    pub async fn create(
        session: Arc<dyn EngineSession>,
        definition: Definition,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let request = SolveRequest { definition, evaluate: true };

        let solved = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                session.close().await;
                return Err(KilnError::Cancelled);
            }
            res = session.solve(request) => res,
        };

        let outcome = match solved {
            Ok(result) => Outcome::Success(result),
            Err(EngineError::Solve { error, .. }) => {
                info!(error = %error, "captured failed step");
                Outcome::Failure(*error)
            }
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        Ok(Self {
            outcome,
            session,
            cancel: CancellationToken::new(),
            cleanups: Mutex::new(Cleanups::default()),
            teardown: OnceCell::new(),
        })
    }

    /// Open a fresh engine session and evaluate `definition` on it.
    ///
    /// Status events from the session are relayed to `progress` until the
    /// evaluation finishes.
    #[instrument(skip_all, fields(engine = %engine.name()))]
    pub async fn open(
        engine: &dyn Engine,
        definition: Definition,
        progress: Option<StatusSender>,
        cancel: &CancellationToken,
        status_buffer: usize,
    ) -> Result<Self> {
        let (status_tx, status_rx) = status::channel(status_buffer);
        let _relay = status::spawn_relay(status_rx, progress, cancel);

        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KilnError::Cancelled),
            res = engine.open_session(status_tx) => res?,
        };

        Self::create(session, definition, cancel).await
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    /// The captured step failure, for failed outcomes.
    pub fn step_error(&self) -> Option<&StepError> {
        match &self.outcome {
            Outcome::Failure(err) => Some(err),
            Outcome::Success(_) => None,
        }
    }

    pub fn engine_session(&self) -> &Arc<dyn EngineSession> {
        &self.session
    }

    /// Resolves when the session is torn down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Container able to run an interactive process against the outcome.
    pub async fn container_request(&self, config: &InvokeConfig) -> Result<ContainerRequest> {
        match &self.outcome {
            Outcome::Success(result) => {
                container_from_result(self.session.as_ref(), result, config).await
            }
            Outcome::Failure(err) => container_from_error(err, config),
        }
    }

    /// Process description for the outcome with `config` applied.
    pub fn process_spec(&self, config: &InvokeConfig) -> Result<ProcessSpec> {
        match &self.outcome {
            Outcome::Success(result) => process_from_result(result, config),
            Outcome::Failure(err) => process_from_error(err, config),
        }
    }

    /// Register a callback to run when the session is closed.
    ///
    /// Callbacks run in registration order.
    pub fn register_cleanup<F, Fut>(&self, cleanup: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut cleanups = lock(&self.cleanups);
        if cleanups.closed {
            return Err(KilnError::SessionClosed);
        }
        cleanups.callbacks.push(Box::new(move || Box::pin(cleanup())));
        Ok(())
    }

    /// Run the cleanups, then cancel and close the engine session.
    ///
    /// Only the first call does any work; concurrent callers wait for it.
    pub async fn close(&self) {
        self.teardown
            .get_or_init(|| async {
                let callbacks = {
                    let mut cleanups = lock(&self.cleanups);
                    cleanups.closed = true;
                    std::mem::take(&mut cleanups.callbacks)
                };

                debug!(cleanups = callbacks.len(), "closing result session");
                for cleanup in callbacks {
                    cleanup().await;
                }

                self.cancel.cancel();
                self.session.close().await;
            })
            .await;
    }
}

impl Drop for ResultSession {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("result session dropped without close");
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ResultSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSession")
            .field("success", &self.is_success())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
