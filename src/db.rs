use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::services::DownloadInfo;

/// Database schema version.
///
/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

/// What gets stored for a completed download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub download_name: String,
    pub download_artist_or_uploader: String,
    pub download_thumbnail: Option<String>,
    pub download_location: String,
    pub service: String,
}

impl DownloadRecord {
    pub fn new(info: DownloadInfo, download_location: &Path, service: &str) -> Self {
        Self {
            download_name: info.download_name,
            download_artist_or_uploader: info.download_artist_or_uploader,
            download_thumbnail: info.download_thumbnail,
            download_location: download_location.to_string_lossy().to_string(),
            service: service.to_string(),
        }
    }
}

/// A stored row, as shown in history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: DownloadRecord,
}

/// Sink for completed downloads.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    /// Persist one record and return its row id.
    async fn save_download(&self, record: &DownloadRecord) -> Result<i64>;
}

/// Database handle wrapper.
///
/// `rusqlite::Connection` is not `Sync`; share it as `Arc<Mutex<Db>>`.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (creating parent directories) and migrate the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db dir: {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("open sqlite db: {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self { conn })
    }

    /// Insert a completed download.
    pub fn insert_download(&mut self, record: &DownloadRecord) -> Result<i64> {
        let now = Utc::now();
        self.conn.execute(
            r#"
            INSERT INTO downloads (
              downloadName, downloadArtistOrUploader, downloadThumbnail,
              downloadLocation, service, createdAt
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.download_name,
                record.download_artist_or_uploader,
                record.download_thumbnail,
                record.download_location,
                record.service,
                now.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent downloads first.
    pub fn list_downloads(&mut self, limit: u32) -> Result<Vec<DownloadRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, downloadName, downloadArtistOrUploader, downloadThumbnail,
                   downloadLocation, service, createdAt
            FROM downloads
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit], Self::row_to_download)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn row_to_download(r: &Row) -> rusqlite::Result<DownloadRow> {
        let created_at: String = r.get(6)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc);

        Ok(DownloadRow {
            id: r.get(0)?,
            created_at,
            record: DownloadRecord {
                download_name: r.get(1)?,
                download_artist_or_uploader: r.get(2)?,
                download_thumbnail: r.get(3)?,
                download_location: r.get(4)?,
                service: r.get(5)?,
            },
        })
    }
}

/// `DownloadStore` backed by the SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Db>>,
}

impl SqliteStore {
    pub fn new(db: Arc<Mutex<Db>>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> Arc<Mutex<Db>> {
        self.db.clone()
    }
}

#[async_trait]
impl DownloadStore for SqliteStore {
    async fn save_download(&self, record: &DownloadRecord) -> Result<i64> {
        let mut db = self.db.lock().await;
        let id = db.insert_download(record)?;
        log::info!(
            "Saved download {} ({} - {})",
            id,
            record.download_artist_or_uploader,
            record.download_name
        );
        Ok(id)
    }
}

/// Apply migrations to bring database to current schema.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(anyhow!(
            "db schema version {} is newer than app supports {}",
            current_version,
            SCHEMA_VERSION
        ));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          downloadName TEXT NOT NULL,
          downloadArtistOrUploader TEXT NOT NULL,
          downloadThumbnail TEXT NULL,
          downloadLocation TEXT NOT NULL,
          service TEXT NOT NULL,
          createdAt TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_downloads_service ON downloads(service);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> DownloadRecord {
        DownloadRecord {
            download_name: name.to_string(),
            download_artist_or_uploader: "Artist".to_string(),
            download_thumbnail: None,
            download_location: "/music".to_string(),
            service: "qobuz".to_string(),
        }
    }

    #[test]
    fn test_insert_and_list() {
        let mut db = Db::open_in_memory().unwrap();
        let first = db.insert_download(&record("One")).unwrap();
        let second = db.insert_download(&record("Two")).unwrap();
        assert!(second > first);

        let rows = db.list_downloads(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].record.download_name, "Two");
        assert_eq!(rows[1].record, record("One"));

        assert_eq!(db.list_downloads(1).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("database.db");
        {
            let mut db = Db::open(&path).unwrap();
            db.insert_download(&record("Kept")).unwrap();
        }
        let mut db = Db::open(&path).unwrap();
        assert_eq!(db.list_downloads(10).unwrap()[0].record.download_name, "Kept");
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        set_schema_version(&mut conn, SCHEMA_VERSION + 1).unwrap();
        assert!(migrate(&mut conn).is_err());
    }

    #[tokio::test]
    async fn test_sqlite_store_saves() {
        let store = SqliteStore::new(Arc::new(Mutex::new(Db::open_in_memory().unwrap())));
        let id = store.save_download(&record("Stored")).await.unwrap();
        assert!(id > 0);

        let db = store.db();
        let mut db = db.lock().await;
        assert_eq!(db.list_downloads(5).unwrap()[0].id, id);
    }
}
