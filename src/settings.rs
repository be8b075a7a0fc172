//! Settings Provider
//!
//! Read-only access to the user's settings file as written by the UI. The file is
//! JSON with camelCase keys; anything the supervisor does not interpret (service
//! credentials, UI toggles) is carried through untouched.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// User settings consumed by the supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    /// Where downloads land. Empty or absent means the platform downloads folder.
    #[serde(default)]
    pub download_location: Option<PathBuf>,

    /// SQLite file holding completed downloads.
    #[serde(default)]
    pub downloads_database_path: Option<PathBuf>,

    /// Every other key, e.g. `qobuz_app_id` or `deezer_arl`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserSettings {
    pub fn download_location_or_default(&self) -> PathBuf {
        match self.download_location {
            Some(ref path) if !path.as_os_str().is_empty() => path.clone(),
            _ => default_download_folder(),
        }
    }

    pub fn database_path_or_default(&self) -> PathBuf {
        match self.downloads_database_path {
            Some(ref path) if !path.as_os_str().is_empty() => path.clone(),
            _ => default_database_path(),
        }
    }
}

// Default value functions
pub fn default_download_folder() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("~/Downloads"))
}

pub fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("MH")
        .join("database.db")
}

/// Determines the per-user config directory.
///
/// macOS:  ~/Library/Application Support/HarborRip
/// Windows: %APPDATA%\\HarborRip
/// Linux:  ~/.config/harborrip
pub fn app_project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "harbor", "HarborRip")
        .ok_or_else(|| anyhow!("failed to resolve per-user app config directory"))
}

pub fn default_settings_path() -> Result<PathBuf> {
    Ok(app_project_dirs()?.config_dir().join("settings.json"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(app_project_dirs()?.config_dir().join("supervisor.json"))
}

/// Source of user settings. Read at the moment a value is needed, not cached.
pub trait SettingsProvider: Send + Sync {
    fn load(&self) -> Result<UserSettings>;

    fn download_location(&self) -> Result<PathBuf> {
        Ok(self.load()?.download_location_or_default())
    }
}

/// A fixed snapshot, used when settings come from somewhere other than disk.
impl SettingsProvider for UserSettings {
    fn load(&self) -> Result<UserSettings> {
        Ok(self.clone())
    }
}

/// Settings stored in a JSON file that the UI may rewrite at any time.
#[derive(Debug, Clone)]
pub struct JsonSettingsFile {
    path: PathBuf,
}

impl JsonSettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsProvider for JsonSettingsFile {
    /// A missing file yields defaults; a malformed one is an error.
    fn load(&self) -> Result<UserSettings> {
        if !self.path.exists() {
            log::debug!(
                "Settings file {} not found, using defaults",
                self.path.display()
            );
            return Ok(UserSettings::default());
        }

        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read settings: {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parse settings: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = UserSettings::default();
        assert_eq!(
            settings.download_location_or_default(),
            default_download_folder()
        );
        assert!(settings
            .database_path_or_default()
            .ends_with(Path::new("MH").join("database.db")));
    }

    #[test]
    fn test_empty_location_falls_back() {
        let settings: UserSettings =
            serde_json::from_str(r#"{"downloadLocation": ""}"#).unwrap();
        assert_eq!(
            settings.download_location_or_default(),
            default_download_folder()
        );
    }

    #[test]
    fn test_unknown_keys_are_kept() {
        let settings: UserSettings = serde_json::from_str(
            r#"{"downloadLocation": "/music", "deezer_arl": "abc", "qobuz_quality": 3}"#,
        )
        .unwrap();
        assert_eq!(settings.download_location, Some(PathBuf::from("/music")));
        assert_eq!(settings.extra["deezer_arl"], "abc");
        assert_eq!(settings.extra["qobuz_quality"], 3);
    }

    #[test]
    fn test_json_file_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let provider = JsonSettingsFile::new(&path);

        assert_eq!(provider.download_location().unwrap(), default_download_folder());

        std::fs::write(&path, r#"{"downloadLocation": "/srv/music"}"#).unwrap();
        assert_eq!(provider.download_location().unwrap(), PathBuf::from("/srv/music"));

        std::fs::write(&path, "{ broken").unwrap();
        assert!(provider.download_location().is_err());
    }
}
