//! Database schema types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Download status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Merging,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "paused" => Some(Self::Paused),
            "merging" => Some(Self::Merging),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Legal edges of the download state machine.
    ///
    /// ```text
    /// Pending -> Downloading -> {Paused, Merging, Failed}
    /// Paused  -> Downloading
    /// Merging -> {Completed, Failed}
    /// ```
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Paused)
                | (Downloading, Merging)
                | (Downloading, Failed)
                | (Paused, Downloading)
                | (Merging, Completed)
                | (Merging, Failed)
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two independently fetched tracks of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download record stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    pub video_url: String,
    pub audio_url: Option<String>,
    pub referer: String,
    pub file_name: String,
    /// Directory the deliverable and the partial files live in
    pub save_path: PathBuf,
    /// Set only once the download is completed
    pub file_path: Option<PathBuf>,
    pub video_size: u64,
    pub audio_size: u64,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub status: DownloadStatus,
    pub error_message: Option<String>,
    pub added_date: DateTime<Utc>,
    pub last_updated_date: DateTime<Utc>,
}

impl Download {
    /// Create a new pending download record
    pub fn new(
        video_url: String,
        audio_url: Option<String>,
        referer: String,
        file_name: String,
        save_path: PathBuf,
        video_size: u64,
        audio_size: u64,
    ) -> Self {
        let now = Utc::now();
        let audio_url = audio_url.filter(|url| !url.is_empty());
        let audio_size = if audio_url.is_some() { audio_size } else { 0 };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            video_url,
            audio_url,
            referer,
            file_name,
            save_path,
            file_path: None,
            video_size,
            audio_size,
            total_size: video_size + audio_size,
            downloaded_size: 0,
            status: DownloadStatus::Pending,
            error_message: None,
            added_date: now,
            last_updated_date: now,
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio_url.is_some()
    }

    /// Partial file for one stream, named from the id so it can be found again
    /// after a restart.
    pub fn temp_file_path(&self, kind: StreamKind) -> PathBuf {
        temp_file_path(&self.save_path, &self.id, kind)
    }

    pub fn stream_url(&self, kind: StreamKind) -> Option<&str> {
        match kind {
            StreamKind::Video => Some(self.video_url.as_str()),
            StreamKind::Audio => self.audio_url.as_deref(),
        }
    }

    pub fn stream_size(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Video => self.video_size,
            StreamKind::Audio => self.audio_size,
        }
    }

    /// Streams this download consists of, video first
    pub fn streams(&self) -> Vec<StreamKind> {
        if self.has_audio() {
            vec![StreamKind::Video, StreamKind::Audio]
        } else {
            vec![StreamKind::Video]
        }
    }
}

pub fn temp_file_path(save_path: &Path, id: &str, kind: StreamKind) -> PathBuf {
    save_path.join(format!("{}.{}.part", id, kind.as_str()))
}
