//! Single-flight build controller.
//!
//! `Idle -> Building -> {Idle, Interactive}`. At most one build runs at a
//! time; a second caller fails fast with [`KilnError::BuildOngoing`]. The last
//! build's [`ResultSession`] is kept so interactive processes can be started
//! from it, whether the build succeeded or failed at a step.

pub mod run;

use crate::config::Config;
use crate::engine::{BuildRequest, Engine, EngineError, SolveResponse, StepError};
use crate::error::{KilnError, Result};
use crate::invoke::InvokeConfig;
use crate::ioset::{BoxReader, IoSet};
use crate::observability::metrics;
use crate::process::{ProcessInfo, ProcessManager};
use crate::result::ResultSession;
use crate::status::{self, StatusSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What a build produced.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Reference to pass to [`BuildController::invoke`].
    pub reference: String,
    /// Exporter response of a successful build.
    pub response: Option<SolveResponse>,
    /// The step that failed, when the build failed at a step.
    pub failure: Option<StepError>,
}

impl BuildOutcome {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Clears the exclusivity flag when the build call returns.
struct BuildGuard<'a>(&'a AtomicBool);

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Orchestrates builds and the interactive processes started from them.
pub struct BuildController {
    engine: Arc<dyn Engine>,
    reference: String,
    status_buffer: usize,
    io_buffer_size: usize,
    building: AtomicBool,
    result: RwLock<Option<Arc<ResultSession>>>,
    processes: ProcessManager,
}

impl BuildController {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self::with_config(engine, &Config::default())
    }

    pub fn with_config(engine: Arc<dyn Engine>, config: &Config) -> Self {
        Self {
            engine,
            reference: config.reference.clone(),
            status_buffer: config.status_buffer,
            io_buffer_size: config.io_buffer_size,
            building: AtomicBool::new(false),
            result: RwLock::new(None),
            processes: ProcessManager::with_buffer_size(config.io_buffer_size),
        }
    }

    /// The single reference this controller answers to.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Capacity of the pipes used for process and build IO.
    pub fn io_buffer_size(&self) -> usize {
        self.io_buffer_size
    }

    pub fn is_building(&self) -> bool {
        self.building.load(Ordering::SeqCst)
    }

    /// Session of the last build, if any.
    pub async fn result_session(&self) -> Option<Arc<ResultSession>> {
        self.result.read().await.clone()
    }

    /// Run a build and capture its outcome.
    ///
    /// A build that fails at a step is not an error: its session is captured
    /// and the failure is reported in [`BuildOutcome::failure`].
    #[instrument(skip_all, fields(engine = %self.engine.name(), target = ?request.target))]
    pub async fn build(
        &self,
        request: &BuildRequest,
        input: BoxReader,
        progress: Option<StatusSender>,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        if self.building.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            metrics::record_build_rejected();
            return Err(KilnError::BuildOngoing);
        }
        let _guard = BuildGuard(&self.building);
        let start = Instant::now();

        let (status_tx, status_rx) = status::channel(self.status_buffer);
        let relay = status::spawn_relay(status_rx, progress.clone(), cancel);
        let built = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                metrics::record_build(start.elapsed().as_secs_f64(), "cancelled");
                return Err(KilnError::Cancelled);
            }
            res = self.engine.build(request, input, status_tx) => res,
        };
        drop(relay);

        let (definition, response) = match built {
            Ok(output) => (output.definition, Some(output.response)),
            Err(EngineError::Solve { error, definition: Some(definition) }) => {
                info!(error = %error, "build failed at a step, capturing it for debugging");
                (definition, None)
            }
            Err(e) => {
                warn!(error = %e, "build failed");
                metrics::record_build(start.elapsed().as_secs_f64(), "error");
                return Err(e.into());
            }
        };

        let session = match ResultSession::open(
            self.engine.as_ref(),
            definition,
            progress,
            cancel,
            self.status_buffer,
        )
        .await
        {
            Ok(session) => Arc::new(session),
            Err(e) => {
                let outcome = if e.is_cancelled() { "cancelled" } else { "error" };
                metrics::record_build(start.elapsed().as_secs_f64(), outcome);
                return Err(e);
            }
        };

        let failure = session.step_error().cloned();
        let previous = self.result.write().await.replace(Arc::clone(&session));
        if let Some(previous) = previous {
            debug!("closing previous result session");
            self.processes.remove_session(&previous).await;
            previous.close().await;
        }

        let outcome = if failure.is_some() { "failed_step" } else { "success" };
        metrics::record_build(start.elapsed().as_secs_f64(), outcome);
        info!(outcome, duration_ms = start.elapsed().as_millis() as u64, "build finished");

        Ok(BuildOutcome { reference: self.reference.clone(), response, failure })
    }

    /// Attach `io` to process `pid`, starting it from the stored session if needed.
    ///
    /// Returns when the process completes, the attachment is revoked
    /// ([`KilnError::IoCancelled`]), or `cancel` fires ([`KilnError::Cancelled`],
    /// IO is detached and the process keeps running).
    #[instrument(skip(self, config, io, cancel))]
    pub async fn invoke(
        &self,
        reference: &str,
        pid: &str,
        config: &InvokeConfig,
        io: IoSet,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.check_reference(reference)?;

        let process = match self.processes.get(pid).await {
            Some(process) => {
                debug!(pid, "attaching to existing process");
                process
            }
            None => {
                let session = self.result_session().await;
                self.processes.start_process(pid, session, config).await?
            }
        };

        let attachment = process.forward_io(io).await;

        tokio::select! {
            _ = attachment.revoked() => {
                metrics::record_io_cancelled();
                Err(KilnError::IoCancelled)
            }
            res = process.wait() => res,
            _ = cancel.cancelled() => {
                process.detach(&attachment).await;
                Err(KilnError::Cancelled)
            }
        }
    }

    pub async fn list_processes(&self, reference: &str) -> Result<Vec<ProcessInfo>> {
        self.check_reference(reference)?;
        Ok(self.processes.list_processes().await)
    }

    /// Stop tracking `pid` and cancel it.
    #[instrument(skip(self))]
    pub async fn disconnect_process(&self, reference: &str, pid: &str) -> Result<()> {
        self.check_reference(reference)?;
        let process = self.processes.delete_process(pid).await?;
        process.cancel();
        Ok(())
    }

    /// Cancel all processes, keeping the stored session.
    pub async fn kill(&self) {
        self.processes.cancel_running_processes().await;
    }

    /// Cancel all processes and close the stored session.
    pub async fn disconnect(&self, reference: &str) -> Result<()> {
        self.check_reference(reference)?;
        self.close().await;
        Ok(())
    }

    /// Cancel all processes and close the stored session.
    ///
    /// Safe to call when no build ever ran.
    pub async fn close(&self) {
        self.processes.cancel_running_processes().await;
        let session = self.result.write().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// References known to this controller.
    pub fn list(&self) -> Vec<String> {
        vec![self.reference.clone()]
    }

    fn check_reference(&self, reference: &str) -> Result<()> {
        if reference != self.reference {
            return Err(KilnError::UnknownRef { reference: reference.to_string() });
        }
        Ok(())
    }
}
