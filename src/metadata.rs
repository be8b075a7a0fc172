//! Metadata Fetcher
//!
//! Runs the per-service helper script in details-only mode and decodes the single
//! JSON document it prints.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::config::SupervisorConfig;
use crate::errors::{Result, SupervisorError};
use crate::process::{self, ProcessOptions};

/// Interpreter names tried in order when none is configured.
#[cfg(windows)]
const PYTHON_CANDIDATES: &[&str] = &["python", "python3"];
#[cfg(not(windows))]
const PYTHON_CANDIDATES: &[&str] = &["python3", "python"];

/// Decoded output of a metadata script. The shape is service specific; only the
/// service profile knows which fields matter.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata(Value);

impl TrackMetadata {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct MetadataFetcher {
    config: Arc<SupervisorConfig>,
    options: ProcessOptions,
}

impl MetadataFetcher {
    pub fn new(config: Arc<SupervisorConfig>) -> Self {
        let options = ProcessOptions::from_config(&config);
        Self { config, options }
    }

    pub fn with_options(mut self, options: ProcessOptions) -> Self {
        self.options = options;
        self
    }

    /// The configured interpreter, or the first Python found on `PATH`.
    pub fn resolve_interpreter(&self) -> Result<PathBuf> {
        if let Some(ref interpreter) = self.config.python_interpreter {
            return Ok(interpreter.clone());
        }

        PYTHON_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| SupervisorError::SpawnFailed("Python interpreter not found".to_string()))
    }

    pub fn resolve_script(&self, service: &str) -> Result<PathBuf> {
        let script = self
            .config
            .script_for(service)
            .ok_or_else(|| SupervisorError::UnsupportedService(service.to_string()))?;

        if !script.exists() {
            return Err(SupervisorError::ScriptNotFound(script.display().to_string()));
        }
        Ok(script)
    }

    /// Fetch details for `track_id`. Not retried.
    pub async fn fetch(&self, service: &str, track_id: &str) -> Result<TrackMetadata> {
        log::info!("Fetching service details: {} track {}", service, track_id);

        let interpreter = self.resolve_interpreter()?;
        let script = self.resolve_script(service)?;
        let args = vec![
            script.to_string_lossy().to_string(),
            "--get-details".to_string(),
            track_id.to_string(),
        ];

        let child = process::spawn(&interpreter.to_string_lossy(), &args, &self.options)?;
        // Dropping the wait on timeout kills the script (kill_on_drop).
        let limit = self.config.metadata_timeout();
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                log::error!("Metadata script for track {} timed out after {:?}", track_id, limit);
                return Err(SupervisorError::MetadataTimedOut(limit));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        log::debug!(
            "Metadata script closed: code={:?} stdout={} stderr={}",
            output.status.code(),
            stdout,
            stderr
        );

        if !output.status.success() {
            log::error!(
                "Metadata script failed: code={:?} stderr={}",
                output.status.code(),
                stderr
            );
            return Err(SupervisorError::MetadataFetchFailed {
                code: output.status.code(),
                stderr,
            });
        }

        match serde_json::from_str::<Value>(&stdout) {
            Ok(details) => Ok(TrackMetadata(details)),
            Err(e) => {
                log::error!("Failed to parse service details: {} (output: {})", e, stdout);
                Err(SupervisorError::MetadataParseFailed {
                    reason: e.to_string(),
                    raw_output: stdout,
                })
            }
        }
    }
}
