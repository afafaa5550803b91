//! Vibe Media - a resumable downloader for split video/audio media
//!
//! Downloads are persisted in SQLite so they survive restarts; each one
//! fetches its streams in parallel with HTTP range requests and merges
//! them into a single file once every byte is on disk.

pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod server;

use parking_lot::RwLock;
use std::path::PathBuf;

use crate::config::Settings;
use crate::db::Database;
use crate::download::DownloadManager;

/// Application state shared across all components
pub struct AppState {
    pub settings: RwLock<Settings>,
    /// Where settings changes are written back to
    pub config_path: PathBuf,
    pub download_manager: DownloadManager,
}

impl AppState {
    pub fn new(settings: Settings, config_path: PathBuf, db: Database) -> reqwest::Result<Self> {
        let download_manager = DownloadManager::from_settings(db, &settings)?;
        Ok(Self {
            settings: RwLock::new(settings),
            config_path,
            download_manager,
        })
    }
}
