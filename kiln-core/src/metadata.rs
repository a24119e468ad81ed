//! Build metadata summary.
//!
//! Exporter responses carry string values, some of which are base64-encoded
//! JSON objects. [`BuildMetadata`] decodes those into structured JSON so the
//! summary file is readable by tooling.

use crate::engine::{SolveResponse, IMAGE_CONFIG_DIGEST_KEY, IMAGE_DIGEST_KEY};
use crate::error::{KilnError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Decoded exporter response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildMetadata(Map<String, Value>);

impl BuildMetadata {
    /// Decode an exporter response.
    ///
    /// Values that are base64-encoded JSON objects become JSON; everything else
    /// is kept as a string.
    pub fn from_response(response: &SolveResponse) -> Self {
        let map = response
            .exporter_response
            .iter()
            .map(|(key, value)| (key.clone(), decode_value(value)))
            .collect();
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Image id to report: the config digest when present, else the manifest digest.
    pub fn image_digest(&self) -> Option<&str> {
        [IMAGE_CONFIG_DIGEST_KEY, IMAGE_DIGEST_KEY]
            .into_iter()
            .find_map(|key| self.0.get(key).and_then(Value::as_str).filter(|d| !d.is_empty()))
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

fn decode_value(value: &str) -> Value {
    let Ok(decoded) = STANDARD.decode(value) else {
        return Value::String(value.to_string());
    };
    match serde_json::from_slice::<Map<String, Value>>(&decoded) {
        Ok(object) if !object.is_empty() => Value::Object(object),
        _ => Value::String(value.to_string()),
    }
}

/// Atomically write `metadata` to `path` as pretty JSON.
pub fn write_metadata_file(path: &Path, metadata: &BuildMetadata) -> Result<()> {
    let content = serde_json::to_vec_pretty(metadata)
        .map_err(|e| KilnError::Internal(format!("Failed to serialize build metadata: {}", e)))?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| KilnError::IoError { path: parent.to_path_buf(), source: e })?;
    tmp.write_all(&content)
        .map_err(|e| KilnError::IoError { path: tmp.path().to_path_buf(), source: e })?;
    tmp.persist(path).map_err(|e| KilnError::IoError { path: path.to_path_buf(), source: e.error })?;

    debug!(path = %path.display(), keys = metadata.0.len(), "wrote build metadata");
    Ok(())
}
