//! Container and process reconstruction from a build outcome.
//!
//! Success path: the final filesystem is bind-mounted over `/` and the process
//! defaults come from the image config. Failure path: the failed exec step's
//! mounts are recreated from its input or output snapshots and the process
//! defaults come from the step's own metadata. Caller overrides win in both.

use crate::engine::{
    ContainerMount, ContainerRequest, EngineSession, ExecOp, Op, ProcessSpec, SolveRequest,
    SolveResult, StepError, IMAGE_CONFIG_KEY,
};
use crate::error::{KilnError, Result};
use crate::invoke::InvokeConfig;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Subset of an OCI image config used to seed interactive processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageConfig {
    pub user: Option<String>,
    pub env: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: Option<HashMap<String, String>>,
    pub stop_signal: Option<String>,
}

/// OCI image document as carried in the result metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImageSpec {
    pub architecture: Option<String>,
    pub os: Option<String>,
    pub config: ImageConfig,
}

/// Parse the image config from result metadata, if present.
pub fn image_config(result: &SolveResult) -> Result<Option<ImageConfig>> {
    match result.metadata.get(IMAGE_CONFIG_KEY) {
        Some(raw) if !raw.is_empty() => {
            let spec: ImageSpec = serde_json::from_slice(raw)
                .map_err(|source| KilnError::InvalidImageConfig { source })?;
            Ok(Some(spec.config))
        }
        _ => Ok(None),
    }
}

/// Container for a successful result: the final snapshot mounted at `/`.
pub async fn container_from_result(
    session: &dyn EngineSession,
    result: &SolveResult,
    config: &InvokeConfig,
) -> Result<ContainerRequest> {
    let reference = result.reference.as_ref().ok_or(KilnError::MissingReference)?;
    if config.initial {
        return Err(KilnError::InitialStateOnSuccess);
    }

    let resolved = session
        .solve(SolveRequest { definition: reference.definition.clone(), evaluate: false })
        .await?;
    let root = resolved.reference.ok_or(KilnError::MissingReference)?;
    debug!(reference = %root.id, "mounting final result at /");

    Ok(ContainerRequest { mounts: vec![ContainerMount::root(root.id)], ..Default::default() })
}

/// Process for a successful result, defaulting to the image config.
pub fn process_from_result(result: &SolveResult, config: &InvokeConfig) -> Result<ProcessSpec> {
    let image = image_config(result)?.unwrap_or_default();

    let user = config.user.clone().or_else(|| image.user.filter(|u| !u.is_empty()));
    let cwd = config.cwd.clone().or_else(|| image.working_dir.filter(|d| !d.is_empty()));

    let mut env = image.env;
    env.extend(config.env.iter().cloned());

    let mut args = config.entrypoint.clone().or(image.entrypoint).unwrap_or_default();
    args.extend(config.cmd.clone().or(image.cmd).unwrap_or_default());

    Ok(ProcessSpec { args, env, cwd, user, tty: config.tty })
}

/// Container for a failed step: its mounts backed by input or output snapshots.
pub fn container_from_error(error: &StepError, config: &InvokeConfig) -> Result<ContainerRequest> {
    let exec = exec_op(error)?;
    let ids = if config.initial { &error.input_ids } else { &error.mount_ids };
    let which = if config.initial { "input" } else { "output" };

    if ids.len() != exec.mounts.len() {
        return Err(KilnError::MalformedStepError {
            reason: format!(
                "step declares {} mounts but carries {} {which} ids",
                exec.mounts.len(),
                ids.len()
            ),
        });
    }

    let mounts = exec
        .mounts
        .iter()
        .zip(ids)
        .map(|(mount, id)| ContainerMount {
            dest: mount.dest.clone(),
            mount_type: mount.mount_type,
            reference_id: id.clone(),
            selector: mount.selector.clone(),
            readonly: mount.readonly,
            cache_opt: mount.cache_opt.clone(),
            secret_opt: mount.secret_opt.clone(),
            ssh_opt: mount.ssh_opt.clone(),
        })
        .collect();

    Ok(ContainerRequest { mounts, network: exec.network })
}

/// Process for a failed step, defaulting to the step's own command.
pub fn process_from_error(error: &StepError, config: &InvokeConfig) -> Result<ProcessSpec> {
    let meta = &exec_op(error)?.meta;

    let user = config.user.clone().or_else(|| non_empty(&meta.user));
    let cwd = config.cwd.clone().or_else(|| non_empty(&meta.cwd));

    let mut env = meta.env.clone();
    env.extend(config.env.iter().cloned());

    let mut args = config.entrypoint.clone().unwrap_or_default();
    args.extend(config.cmd.clone().unwrap_or_default());
    if args.is_empty() {
        args = meta.args.clone();
    }

    Ok(ProcessSpec { args, env, cwd, user, tty: config.tty })
}

fn exec_op(error: &StepError) -> Result<&ExecOp> {
    match &error.op {
        Op::Exec(exec) => Ok(exec),
        other => Err(KilnError::UnsupportedStep { kind: other.kind().to_string() }),
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
