//! Data exchanged with the build engine.
//!
//! These types mirror the engine's build graph closely enough to rebuild a
//! failing step's environment: the failing operation, its declared mounts and
//! the per-mount input/output reference ids.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Metadata key under which the engine stores the final image config JSON.
pub const IMAGE_CONFIG_KEY: &str = "containerimage.config";

/// Exporter response key holding the image manifest digest.
pub const IMAGE_DIGEST_KEY: &str = "containerimage.digest";

/// Exporter response key holding the image config digest.
pub const IMAGE_CONFIG_DIGEST_KEY: &str = "containerimage.config.digest";

/// Serialized build graph, opaque to Kiln.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Definition(Vec<u8>);

impl Definition {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Content reference for a filesystem snapshot produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Engine-assigned id of the snapshot.
    pub id: String,
    /// Definition that produces this snapshot, used to re-resolve it.
    pub definition: Definition,
}

/// Options for a build submitted to the engine.
///
/// Kiln never interprets these; they are handed to [`Engine::build`](super::Engine::build).
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Path to the build context directory
    pub context_path: PathBuf,

    /// Path to Dockerfile relative to context (default: "Dockerfile")
    pub dockerfile: String,

    /// Image references to tag the result with
    pub tags: Vec<String>,

    /// Build arguments (ARG values)
    pub build_args: HashMap<String, String>,

    /// Target build stage for multi-stage builds
    pub target: Option<String>,

    /// Disable build cache
    pub no_cache: bool,

    /// Always attempt to pull referenced images
    pub pull: bool,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            context_path: PathBuf::from("."),
            dockerfile: "Dockerfile".to_string(),
            tags: Vec::new(),
            build_args: HashMap::new(),
            target: None,
            no_cache: false,
            pull: false,
        }
    }
}

impl BuildRequest {
    /// Whether the Dockerfile or the context is read from stdin (`-`).
    pub fn reads_stdin(&self) -> bool {
        self.dockerfile == "-" || self.context_path == Path::new("-")
    }
}

/// Final response of a build, as reported by the exporter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveResponse {
    pub exporter_response: HashMap<String, String>,
}

/// What a completed build hands back to the controller.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub response: SolveResponse,
    /// Definition of the final result, evaluated again to open a result session.
    pub definition: Definition,
}

/// Request to evaluate a definition on an engine session.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub definition: Definition,
    /// Force evaluation instead of returning a lazy reference.
    pub evaluate: bool,
}

/// Successful evaluation of a definition.
#[derive(Debug, Clone, Default)]
pub struct SolveResult {
    pub reference: Option<Reference>,
    pub metadata: HashMap<String, Vec<u8>>,
}

impl SolveResult {
    pub fn with_reference(reference: Reference) -> Self {
        Self { reference: Some(reference), metadata: HashMap::new() }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Network mode of an exec step or container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetMode {
    #[default]
    Unset,
    Host,
    None,
}

/// Kind of a mount declared by an exec step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    #[default]
    Bind,
    Secret,
    Ssh,
    Cache,
    Tmpfs,
}

/// Sharing mode for cache mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSharing {
    #[default]
    Shared,
    Private,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOpt {
    pub id: String,
    pub sharing: CacheSharing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretOpt {
    pub id: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshOpt {
    pub id: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub optional: bool,
}

/// A mount declared by an exec step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mount {
    pub dest: String,
    pub selector: String,
    pub mount_type: MountType,
    pub readonly: bool,
    pub cache_opt: Option<CacheOpt>,
    pub secret_opt: Option<SecretOpt>,
    pub ssh_opt: Option<SshOpt>,
}

/// Process metadata of an exec step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecMeta {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub user: String,
}

/// An "execute command" step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecOp {
    pub meta: ExecMeta,
    pub mounts: Vec<Mount>,
    pub network: NetMode,
}

/// One node of the build graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Exec(ExecOp),
    File,
    Source { identifier: String },
    Build,
    Merge,
    Diff,
}

impl Op {
    /// Short name of the step kind, for errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Exec(_) => "exec",
            Op::File => "file",
            Op::Source { .. } => "source",
            Op::Build => "build",
            Op::Merge => "merge",
            Op::Diff => "diff",
        }
    }
}

/// Structured failure of a single build step.
///
/// `input_ids[i]` and `mount_ids[i]` are the snapshots mounted at the step's
/// `i`-th mount before and after the step ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub op: Op,
    pub input_ids: Vec<String>,
    pub mount_ids: Vec<String>,
    pub message: String,
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} step failed: {}", self.op.kind(), self.message)
    }
}

/// A mount of a container materialized for an interactive process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMount {
    pub dest: String,
    pub mount_type: MountType,
    /// Snapshot backing the mount.
    pub reference_id: String,
    pub selector: String,
    pub readonly: bool,
    pub cache_opt: Option<CacheOpt>,
    pub secret_opt: Option<SecretOpt>,
    pub ssh_opt: Option<SshOpt>,
}

impl ContainerMount {
    /// Read-write bind mount of a snapshot over `/`.
    pub fn root(reference_id: impl Into<String>) -> Self {
        Self {
            dest: "/".to_string(),
            mount_type: MountType::Bind,
            reference_id: reference_id.into(),
            selector: String::new(),
            readonly: false,
            cache_opt: None,
            secret_opt: None,
            ssh_opt: None,
        }
    }
}

/// Request to materialize a container on an engine session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub mounts: Vec<ContainerMount>,
    pub network: NetMode,
}

/// Fully resolved description of an interactive process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    /// `KEY=VALUE` entries; later duplicates win.
    pub env: Vec<String>,
    /// Working directory, or the container default when unset.
    pub cwd: Option<String>,
    /// User to run as, or the container default when unset.
    pub user: Option<String>,
    pub tty: bool,
}

impl ProcessSpec {
    /// Resolve `key` against the environment with last-wins semantics.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().rev().find_map(|entry| match entry.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            _ => None,
        })
    }
}

/// Terminal dimensions for tty processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WinSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}
