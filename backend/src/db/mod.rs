//! Download registry: durable table of every download entity

mod schema;

pub use schema::*;

use crate::error::RegistryError;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, RegistryError>;

const SELECT_COLUMNS: &str = r#"
    SELECT id, video_url, audio_url, referer, file_name, save_path, file_path,
           video_size, audio_size, total_size, downloaded_size, status,
           error_message, added_date, last_updated_date
    FROM downloads
"#;

/// Database wrapper for SQLite operations.
///
/// Every method holds the connection lock for a single statement batch, so
/// writes to one entity never interleave.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database at the default location
    pub fn new() -> Result<Self> {
        Self::open(Self::db_path())
    }

    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Get the database file path
    fn db_path() -> PathBuf {
        crate::config::config_dir().join("downloads.db")
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                video_url TEXT NOT NULL,
                audio_url TEXT,
                referer TEXT NOT NULL,
                file_name TEXT NOT NULL,
                save_path TEXT NOT NULL,
                file_path TEXT,
                video_size INTEGER NOT NULL,
                audio_size INTEGER NOT NULL DEFAULT 0,
                total_size INTEGER NOT NULL,
                downloaded_size INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                added_date TEXT NOT NULL,
                last_updated_date TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
            CREATE INDEX IF NOT EXISTS idx_downloads_added_date ON downloads(added_date);
            "#,
        )?;

        Ok(())
    }

    /// Insert a new download record
    pub fn insert_download(&self, download: &Download) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO downloads (
                id, video_url, audio_url, referer, file_name, save_path, file_path,
                video_size, audio_size, total_size, downloaded_size, status,
                error_message, added_date, last_updated_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                download.id,
                download.video_url,
                download.audio_url,
                download.referer,
                download.file_name,
                download.save_path.to_string_lossy(),
                download
                    .file_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                download.video_size,
                download.audio_size,
                download.total_size,
                download.downloaded_size,
                download.status.as_str(),
                download.error_message,
                timestamp(&download.added_date),
                timestamp(&download.last_updated_date),
            ],
        )?;

        Ok(())
    }

    /// Get a single download
    pub fn get_download(&self, id: &str) -> Result<Option<Download>> {
        let conn = self.conn.lock();
        fetch_one(&conn, id)
    }

    /// Get all downloads, newest first
    pub fn get_all_downloads(&self) -> Result<Vec<Download>> {
        self.query(
            &format!("{SELECT_COLUMNS} ORDER BY added_date DESC, rowid DESC"),
            params![],
        )
    }

    /// Get pending, downloading and paused downloads in FIFO order
    pub fn get_unfinished_downloads(&self) -> Result<Vec<Download>> {
        self.query(
            &format!(
                "{SELECT_COLUMNS} WHERE status IN ('pending', 'downloading', 'paused', 'merging') \
                 ORDER BY added_date ASC, rowid ASC"
            ),
            params![],
        )
    }

    /// Get downloads with the given status, oldest first
    pub fn get_downloads_by_status(&self, status: DownloadStatus) -> Result<Vec<Download>> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY added_date ASC, rowid ASC"),
            params![status.as_str()],
        )
    }

    /// Find downloads whose file name contains `text`
    pub fn search_downloads(&self, text: &str) -> Result<Vec<Download>> {
        let pattern = format!(
            "%{}%",
            text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        self.query(
            &format!(
                "{SELECT_COLUMNS} WHERE file_name LIKE ?1 ESCAPE '\\' ORDER BY added_date DESC, rowid DESC"
            ),
            params![pattern],
        )
    }

    /// Record a progress checkpoint.
    ///
    /// Progress never moves backwards and never exceeds the total size.
    pub fn update_progress(&self, id: &str, downloaded: u64) -> Result<()> {
        let conn = self.conn.lock();

        let (recorded, total): (u64, u64) = conn
            .query_row(
                "SELECT downloaded_size, total_size FROM downloads WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if downloaded < recorded || downloaded > total {
            return Err(RegistryError::InvalidProgress {
                id: id.to_string(),
                downloaded,
                recorded,
                total,
            });
        }

        conn.execute(
            "UPDATE downloads SET downloaded_size = ?1, last_updated_date = ?2 WHERE id = ?3",
            params![downloaded, timestamp(&Utc::now()), id],
        )?;

        Ok(())
    }

    /// Move a download to a new status, rejecting transitions the state
    /// machine does not allow. Returns the updated record.
    pub fn update_status(
        &self,
        id: &str,
        status: DownloadStatus,
        reason: Option<&str>,
    ) -> Result<Download> {
        self.transition(id, status, reason, None)
    }

    /// Finish a merged download, recording where the deliverable ended up
    pub fn complete_download(&self, id: &str, file_path: &Path) -> Result<Download> {
        self.transition(id, DownloadStatus::Completed, None, Some(file_path))
    }

    fn transition(
        &self,
        id: &str,
        status: DownloadStatus,
        reason: Option<&str>,
        file_path: Option<&Path>,
    ) -> Result<Download> {
        let conn = self.conn.lock();

        let current = fetch_one(&conn, id)?.ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if !current.status.can_transition_to(status) {
            return Err(RegistryError::IllegalTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            });
        }

        conn.execute(
            r#"
            UPDATE downloads
            SET status = ?1, error_message = ?2, file_path = ?3, last_updated_date = ?4
            WHERE id = ?5
            "#,
            params![
                status.as_str(),
                reason,
                file_path.map(|p| p.to_string_lossy().into_owned()),
                timestamp(&Utc::now()),
                id,
            ],
        )?;

        fetch_one(&conn, id)?.ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Reclassify downloads left in `downloading` by an unclean shutdown
    pub fn mark_interrupted(&self, reason: &str) -> Result<Vec<Download>> {
        let interrupted = self.get_downloads_by_status(DownloadStatus::Downloading)?;
        let mut paused = Vec::with_capacity(interrupted.len());
        for download in interrupted {
            paused.push(self.update_status(&download.id, DownloadStatus::Paused, Some(reason))?);
        }
        Ok(paused)
    }

    /// Delete a download record. Returns false if it did not exist.
    pub fn delete_download(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM downloads WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Download>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let downloads = stmt
            .query_map(params, row_to_download)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(downloads)
    }
}

fn fetch_one(conn: &Connection, id: &str) -> Result<Option<Download>> {
    let download = conn
        .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), [id], row_to_download)
        .optional()?;
    Ok(download)
}

fn row_to_download(row: &Row<'_>) -> rusqlite::Result<Download> {
    let status: String = row.get(11)?;
    let status = DownloadStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            11,
            rusqlite::types::Type::Text,
            format!("unknown status `{status}`").into(),
        )
    })?;

    Ok(Download {
        id: row.get(0)?,
        video_url: row.get(1)?,
        audio_url: row.get(2)?,
        referer: row.get(3)?,
        file_name: row.get(4)?,
        save_path: PathBuf::from(row.get::<_, String>(5)?),
        file_path: row.get::<_, Option<String>>(6)?.map(PathBuf::from),
        video_size: row.get(7)?,
        audio_size: row.get(8)?,
        total_size: row.get(9)?,
        downloaded_size: row.get(10)?,
        status,
        error_message: row.get(12)?,
        added_date: parse_timestamp(row, 13)?,
        last_updated_date: parse_timestamp(row, 14)?,
    })
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
