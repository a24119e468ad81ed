//! Interactive process overrides and the invoke flag grammar.
//!
//! ```text
//! default | debug-shell | on-error
//! <command>
//! key=value[,key=value...]    keys: args entrypoint env user cwd tty initial
//! ```
//!
//! Fields are comma separated and may be double-quoted (`"env=A=1,2"`), with
//! `""` escaping a quote inside a quoted field.

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Caller overrides for an interactive process.
///
/// `user` and `cwd` left as `None` fall back to the image config or the failed
/// step's metadata. `initial` selects the failed step's input snapshots rather
/// than its outputs and is only valid on a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub cwd: Option<String>,
    pub tty: bool,
    pub initial: bool,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self { entrypoint: None, cmd: None, env: Vec::new(), user: None, cwd: None, tty: true, initial: false }
    }
}

impl InvokeConfig {
    /// Interactive `/bin/sh`.
    pub fn shell() -> Self {
        Self { cmd: Some(vec!["/bin/sh".to_string()]), ..Default::default() }
    }

    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }
}

/// How the invoke flag was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeMode {
    /// Run the result's default command.
    Default,
    /// Skip the build and attach to the stored result.
    DebugShell,
    /// Start a shell only if the build fails.
    OnError,
    /// Command or `key=value` fields.
    Custom,
}

/// Parsed invoke flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeRequest {
    pub mode: InvokeMode,
    pub config: InvokeConfig,
    raw: String,
}

impl InvokeRequest {
    /// The flag as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the build step is skipped entirely.
    pub fn skips_build(&self) -> bool {
        self.mode == InvokeMode::DebugShell
    }

    /// Whether an interactive session follows a build with this outcome.
    pub fn needs_monitor(&self, build_failed: bool) -> bool {
        match self.mode {
            InvokeMode::DebugShell => true,
            InvokeMode::OnError => build_failed,
            InvokeMode::Default | InvokeMode::Custom => true,
        }
    }
}

impl FromStr for InvokeRequest {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.to_string();
        let mut config = InvokeConfig::default();

        let mode = match s {
            "" => return Err(KilnError::invoke_config("empty invoke flag")),
            "default" => InvokeMode::Default,
            "debug-shell" => InvokeMode::DebugShell,
            "on-error" => {
                // The step's own command would just fail again.
                config.cmd = Some(vec!["/bin/sh".to_string()]);
                InvokeMode::OnError
            }
            _ => {
                parse_fields(s, &mut config)?;
                InvokeMode::Custom
            }
        };

        Ok(Self { mode, config, raw })
    }
}

fn parse_fields(input: &str, config: &mut InvokeConfig) -> Result<()> {
    let fields = split_fields(input)?;

    if let [command] = fields.as_slice() {
        if !command.contains('=') {
            config.cmd = Some(vec![command.clone()]);
            return Ok(());
        }
    }

    for field in fields {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| KilnError::invoke_config(format!("invalid value {field}")))?;
        let value = value.to_string();

        match key.to_ascii_lowercase().as_str() {
            "args" => config.cmd.get_or_insert_with(Vec::new).push(value),
            "entrypoint" => config.entrypoint.get_or_insert_with(Vec::new).push(value),
            "env" => config.env.push(value),
            "user" => config.user = Some(value),
            "cwd" => config.cwd = Some(value),
            "tty" => config.tty = parse_bool("tty", &value)?,
            "initial" => config.initial = parse_bool("initial", &value)?,
            other => return Err(KilnError::invoke_config(format!("unknown key {other:?}"))),
        }
    }

    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(KilnError::invoke_config(format!("failed to parse {key}: invalid syntax {value:?}"))),
    }
}

/// Split a single comma separated record, honoring double-quoted fields.
fn split_fields(input: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = input.chars().peekable();
    let mut in_quotes = false;
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
                quoted = false;
            }
            '"' => return Err(KilnError::invoke_config("bare \" in non-quoted field")),
            _ if quoted && !in_quotes => {
                return Err(KilnError::invoke_config("extraneous characters after quoted field"))
            }
            c => field.push(c),
        }
    }

    if in_quotes {
        return Err(KilnError::invoke_config("unterminated quoted field"));
    }
    fields.push(field);
    Ok(fields)
}
