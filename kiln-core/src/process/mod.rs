//! Interactive process registry.
//!
//! Tracks processes started against a [`ResultSession`] by caller-chosen id.
//! Ids are unique while an entry exists; deleting or cancelling an entry frees
//! its id for reuse.

mod entry;

pub use entry::{Attachment, Process, ProcessInfo, ProcessStatus};

use crate::error::{KilnError, Result};
use crate::invoke::InvokeConfig;
use crate::ioset::DEFAULT_PIPE_CAPACITY;
use crate::observability::metrics;
use crate::result::ResultSession;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Registry of interactive processes.
pub struct ProcessManager {
    processes: RwLock<BTreeMap<String, Arc<Process>>>,
    buffer_size: usize,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_PIPE_CAPACITY)
    }

    /// Manager whose processes use pipes of `buffer_size` bytes.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self { processes: RwLock::new(BTreeMap::new()), buffer_size }
    }

    /// Start a process named `pid` against `session`.
    #[instrument(skip(self, session, config))]
    pub async fn start_process(
        &self,
        pid: &str,
        session: Option<Arc<ResultSession>>,
        config: &InvokeConfig,
    ) -> Result<Arc<Process>> {
        if self.processes.read().await.contains_key(pid) {
            return Err(KilnError::ProcessExists { pid: pid.to_string() });
        }
        let session = session.ok_or(KilnError::NoBuildResult)?;

        let process = Process::start(pid, session, config, self.buffer_size).await?;

        let mut processes = self.processes.write().await;
        if processes.contains_key(pid) {
            // Lost a race with a concurrent start of the same id.
            process.cancel();
            return Err(KilnError::ProcessExists { pid: pid.to_string() });
        }
        processes.insert(pid.to_string(), Arc::clone(&process));
        metrics::record_process_started();
        metrics::set_process_count(processes.len());

        Ok(process)
    }

    pub async fn get(&self, pid: &str) -> Option<Arc<Process>> {
        self.processes.read().await.get(pid).cloned()
    }

    /// Tracked processes, ordered by id.
    pub async fn list_processes(&self) -> Vec<ProcessInfo> {
        self.processes.read().await.values().map(|p| p.info()).collect()
    }

    /// Stop tracking `pid` and revoke its attachment.
    ///
    /// The process keeps running; the caller decides whether to cancel it.
    #[instrument(skip(self))]
    pub async fn delete_process(&self, pid: &str) -> Result<Arc<Process>> {
        let process = {
            let mut processes = self.processes.write().await;
            let process = processes
                .remove(pid)
                .ok_or_else(|| KilnError::UnknownProcess { pid: pid.to_string() })?;
            metrics::set_process_count(processes.len());
            process
        };
        process.detach_current().await;
        Ok(process)
    }

    /// Cancel and stop tracking every process started from `session`.
    ///
    /// Frees their ids for processes on a newer session.
    #[instrument(skip_all)]
    pub async fn remove_session(&self, session: &Arc<ResultSession>) {
        let removed: Vec<_> = {
            let mut processes = self.processes.write().await;
            let pids: Vec<_> = processes
                .iter()
                .filter(|(_, p)| Arc::ptr_eq(p.session(), session))
                .map(|(pid, _)| pid.clone())
                .collect();
            let removed = pids.into_iter().filter_map(|pid| processes.remove(&pid)).collect();
            metrics::set_process_count(processes.len());
            removed
        };

        for process in removed {
            debug!(pid = %process.pid(), "dropping process of replaced session");
            process.cancel();
            process.detach_current().await;
        }
    }

    /// Cancel every tracked process and clear the registry.
    #[instrument(skip(self))]
    pub async fn cancel_running_processes(&self) {
        let drained = std::mem::take(&mut *self.processes.write().await);
        metrics::set_process_count(0);

        if !drained.is_empty() {
            info!(count = drained.len(), "cancelling interactive processes");
        }
        for (pid, process) in drained {
            process.cancel();
            process.detach_current().await;
            if let Err(e) = process.wait().await {
                if !e.is_cancelled() {
                    warn!(pid = %pid, error = %e, "process ended with error during cancellation");
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.processes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processes.read().await.is_empty()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
