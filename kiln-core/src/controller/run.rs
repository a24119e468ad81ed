//! Build-then-interact flow with a single stdin handoff.
//!
//! Caller stdin is read by one [`SingleForwarder`]. During the build its
//! writer feeds the build input pipe; when the build finishes that pipe is
//! closed and, if an interactive session follows, the writer is switched to a
//! fresh pipe feeding the monitor process.

use super::{BuildController, BuildOutcome};
use crate::engine::BuildRequest;
use crate::error::{KilnError, Result};
use crate::invoke::InvokeRequest;
use crate::ioset::{close_on_replace, pipe, BoxWriter, IoSet, SingleForwarder};
use crate::status::StatusSender;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Caller streams for [`run_build`].
pub struct RunIo<R> {
    pub stdin: R,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
}

/// Run a build and, if `invoke` asks for it, an interactive process afterwards.
///
/// Returns the build outcome, or `None` when the build was skipped
/// (`debug-shell`). Interactive session failures are logged, not returned.
pub async fn run_build<R>(
    controller: &BuildController,
    request: &BuildRequest,
    invoke: Option<&InvokeRequest>,
    io: RunIo<R>,
    progress: Option<StatusSender>,
    cancel: &CancellationToken,
) -> Result<Option<BuildOutcome>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    if invoke.is_some() && request.reads_stdin() {
        return Err(KilnError::invoke_config(
            "cannot invoke a process when the Dockerfile or context is read from stdin",
        ));
    }

    let reference = controller.reference().to_string();
    let buffer_size = controller.io_buffer_size();
    let stdin = SingleForwarder::with_capacity(buffer_size);
    let _closed = stdin.set_source(io.stdin).await;

    let mut outcome = None;
    if !invoke.is_some_and(InvokeRequest::skips_build) {
        let (input_w, input_r) = pipe(buffer_size);
        stdin.set_writer(input_w, Some(close_on_replace())).await;

        match controller.build(request, Box::new(input_r), progress, cancel).await {
            Ok(built) => outcome = Some(built),
            Err(KilnError::BuildOngoing) => {
                stdin.close().await;
                return Err(KilnError::BuildOngoing);
            }
            Err(e) => {
                stdin.close().await;
                if let Err(disconnect_err) = controller.disconnect(&reference).await {
                    warn!(error = %disconnect_err, "failed to disconnect after build error");
                }
                return Err(e);
            }
        }
    }

    let failed = outcome.as_ref().is_some_and(BuildOutcome::is_failed);
    match invoke {
        Some(invoke) if invoke.needs_monitor(failed) => {
            let (monitor_w, monitor_r) = pipe(buffer_size);
            stdin.set_writer(monitor_w, Some(close_on_replace())).await;

            let pid = uuid::Uuid::new_v4().to_string();
            info!(pid = %pid, invoke = invoke.as_str(), "starting interactive session");

            let attach = IoSet {
                stdin: Some(Box::new(monitor_r)),
                stdout: Some(io.stdout),
                stderr: Some(io.stderr),
            };
            match controller.invoke(&reference, &pid, &invoke.config, attach, cancel).await {
                Ok(()) => debug!(pid = %pid, "interactive session finished"),
                Err(e) => warn!(pid = %pid, error = %e, "interactive session ended with error"),
            }

            stdin.close().await;
            controller.close().await;
        }
        _ => {
            stdin.close().await;
            controller.disconnect(&reference).await?;
        }
    }

    Ok(outcome)
}
