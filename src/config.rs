//! Supervisor Configuration
//!
//! Process-wide configuration loaded once at startup and shared immutably behind an `Arc`.
//! Every field carries a default so a partial (or missing) JSON file is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One entry of the error dictionary: a literal substring and the message shown for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub pattern: String,
    pub message: String,
}

/// Ordered substring -> message table checked against every line of downloader output.
///
/// Matching is case-sensitive containment and the first entry in definition order wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorDictionary(Vec<ErrorPattern>);

impl ErrorDictionary {
    pub fn new(entries: Vec<ErrorPattern>) -> Self {
        Self(entries)
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ErrorPattern {
                pattern: "AuthenticationError: Invalid credentials".to_string(),
                message: "Invalid Credentials".to_string(),
            },
            ErrorPattern {
                pattern: "Found invalid url".to_string(),
                message: "Invalid URL detected, skipping.".to_string(),
            },
            ErrorPattern {
                pattern: "Enter your Qobuz email".to_string(),
                message: "Enter your credintals on settings!".to_string(),
            },
        ])
    }

    /// Returns the message of the first pattern contained in `text`.
    pub fn lookup(&self, text: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|entry| text.contains(entry.pattern.as_str()))
            .map(|entry| entry.message.as_str())
    }
}

impl Default for ErrorDictionary {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Configuration for the download supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Downloader executable; `.exe` is appended on Windows when missing.
    #[serde(default = "default_downloader")]
    pub downloader: String,

    /// Silence allowed from the downloader before it is assumed to be waiting for input.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Upper bound for one metadata script run. The script is killed when it passes.
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,

    /// Sets `DEBUG=1` in the environment of spawned processes.
    #[serde(default = "default_true")]
    pub debug: bool,

    /// Directories prepended to `PATH` on Linux before spawning.
    #[serde(default = "default_extra_paths")]
    pub extra_paths: Vec<PathBuf>,

    /// Explicit interpreter for the metadata scripts. Resolved from `PATH` when absent.
    #[serde(default)]
    pub python_interpreter: Option<PathBuf>,

    /// Directory the metadata script paths are relative to.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Service key -> metadata script, relative to `scripts_dir`.
    #[serde(default = "default_scripts")]
    pub scripts: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub error_dictionary: ErrorDictionary,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            downloader: default_downloader(),
            stall_timeout_ms: default_stall_timeout_ms(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            debug: true,
            extra_paths: default_extra_paths(),
            python_interpreter: None,
            scripts_dir: default_scripts_dir(),
            scripts: default_scripts(),
            error_dictionary: ErrorDictionary::builtin(),
        }
    }
}

impl SupervisorConfig {
    /// Load the configuration from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "No supervisor config at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read supervisor config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse supervisor config: {}", path.display()))?;
        log::info!("Loaded supervisor config from {}", path.display());
        Ok(config)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    /// Absolute path of the metadata script for `service`, if one is registered.
    pub fn script_for(&self, service: &str) -> Option<PathBuf> {
        self.scripts
            .get(service)
            .map(|relative| self.scripts_dir.join(relative))
    }
}

// Default value functions
fn default_downloader() -> String {
    "custom_rip".to_string()
}

fn default_metadata_timeout_ms() -> u64 {
    30_000
}

fn default_stall_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_extra_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/usr/bin"),
        PathBuf::from("/bin"),
    ];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".local").join("bin"));
    }
    paths
}

/// Scripts ship next to the executable in packaged builds.
fn default_scripts_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("apis")))
        .unwrap_or_else(|| PathBuf::from("apis"))
}

fn default_scripts() -> BTreeMap<String, PathBuf> {
    [
        ("youtube", "ytsearchapi.py"),
        ("youtubeMusic", "ytmusicsearchapi.py"),
        ("spotify", "spotifyapi.py"),
        ("tidal", "tidalapi.py"),
        ("deezer", "deezerapi.py"),
        ("qobuz", "qobuzapi.py"),
    ]
    .into_iter()
    .map(|(service, script)| (service.to_string(), PathBuf::from(script)))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.downloader, "custom_rip");
        assert_eq!(config.stall_timeout(), Duration::from_secs(5));
        assert_eq!(config.metadata_timeout(), Duration::from_secs(30));
        assert_eq!(config.error_dictionary, ErrorDictionary::builtin());
        assert_eq!(
            config.error_dictionary.lookup("Enter your Qobuz email:"),
            Some("Enter your credintals on settings!")
        );
        assert_eq!(config.scripts.len(), 6);
    }

    #[test]
    fn test_dictionary_first_match_wins() {
        let dict = ErrorDictionary::new(vec![
            ErrorPattern {
                pattern: "invalid".to_string(),
                message: "first".to_string(),
            },
            ErrorPattern {
                pattern: "Found invalid url".to_string(),
                message: "second".to_string(),
            },
        ]);
        assert_eq!(dict.lookup("Found invalid url: foo"), Some("first"));
    }

    #[test]
    fn test_dictionary_is_case_sensitive() {
        let dict = ErrorDictionary::builtin();
        assert_eq!(
            dict.lookup("[x] Found invalid url https://a"),
            Some("Invalid URL detected, skipping.")
        );
        assert_eq!(dict.lookup("found INVALID URL"), None);
        assert_eq!(dict.lookup("Downloading 12.0%"), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SupervisorConfig =
            serde_json::from_str(r#"{"downloader": "rip", "stallTimeoutMs": 250}"#).unwrap();
        assert_eq!(config.downloader, "rip");
        assert_eq!(config.stall_timeout(), Duration::from_millis(250));
        assert_eq!(config.error_dictionary, ErrorDictionary::builtin());
        assert!(config.debug);
    }

    #[test]
    fn test_custom_dictionary_order_preserved() {
        let config: SupervisorConfig = serde_json::from_str(
            r#"{"errorDictionary": [
                {"pattern": "b", "message": "B"},
                {"pattern": "a", "message": "A"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(config.error_dictionary.lookup("ab"), Some("B"));
    }

    #[test]
    fn test_script_for() {
        let mut config = SupervisorConfig::default();
        config.scripts_dir = PathBuf::from("/opt/harbor/apis");
        assert_eq!(
            config.script_for("qobuz"),
            Some(PathBuf::from("/opt/harbor/apis/qobuzapi.py"))
        );
        assert_eq!(config.script_for("napster"), None);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.downloader, "custom_rip");
    }
}
