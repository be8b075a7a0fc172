use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};

pub mod config;
pub mod db;
pub mod download_manager;
pub mod errors;
pub mod events;
pub mod interpreter;
pub mod metadata;
pub mod process;
pub mod services;
pub mod settings;
pub mod url_utils;
pub mod watchdog;

pub use config::{ErrorDictionary, ErrorPattern, SupervisorConfig};
pub use db::{Db, DownloadRecord, DownloadRow, DownloadStore, SqliteStore};
pub use download_manager::{DownloadManager, DownloadRequest, SessionState};
pub use errors::SupervisorError;
pub use events::{EventEnvelope, SupervisorEvent};
pub use services::{Service, ServiceProfile, ServiceRegistry};
pub use settings::{JsonSettingsFile, SettingsProvider, UserSettings};

/// Capacity of the event channel between sessions and the caller.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared application state: configuration, settings source and the database.
pub struct AppState {
    pub config: Arc<SupervisorConfig>,
    pub settings: Arc<JsonSettingsFile>,
    pub db: Arc<Mutex<Db>>,
}

impl AppState {
    /// Load configuration and settings and open the downloads database.
    ///
    /// Paths default to the per-user config directory. The database location comes
    /// from the settings file, falling back to `<home>/MH/database.db`.
    pub fn init(config_path: Option<PathBuf>, settings_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => settings::default_config_path()?,
        };
        let settings_path = match settings_path {
            Some(path) => path,
            None => settings::default_settings_path()?,
        };

        let config = SupervisorConfig::load(&config_path)?;
        let settings = JsonSettingsFile::new(settings_path);
        let db_path = settings.load()?.database_path_or_default();
        let db = open_db(&db_path)?;

        Ok(Self {
            config: Arc::new(config),
            settings: Arc::new(settings),
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Build a download manager wired to this state. Events go to `event_tx`.
    pub fn download_manager(&self, event_tx: mpsc::Sender<SupervisorEvent>) -> Result<DownloadManager> {
        let registry = ServiceRegistry::builtin()?;
        Ok(DownloadManager::new(
            self.config.clone(),
            Arc::new(registry),
            self.settings.clone(),
            Arc::new(SqliteStore::new(self.db.clone())),
            event_tx,
        ))
    }

    /// Most recent completed downloads first.
    pub async fn history(&self, limit: u32) -> Result<Vec<DownloadRow>> {
        self.db.lock().await.list_downloads(limit)
    }
}

fn open_db(path: &Path) -> Result<Db> {
    log::info!("Opening downloads database at {}", path.display());
    Db::open(path)
}
