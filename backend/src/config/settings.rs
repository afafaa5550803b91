//! Settings data structures

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Browser user agent sent with every media request
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 Edg/126.0.0.0";

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Maximum number of downloads transferring or merging at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Transfer tuning and default destination
    #[serde(default)]
    pub downloads: DownloadSettings,

    /// How finished video and audio streams are combined
    #[serde(default)]
    pub merge: MergeSettings,
}

fn default_max_concurrent() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            max_concurrent_downloads: default_max_concurrent(),
            downloads: DownloadSettings::default(),
            merge: MergeSettings::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host to bind to (0.0.0.0 for LAN access)
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Default directory for deliverables and partial files
    pub save_path: PathBuf,

    pub user_agent: String,

    /// Largest number of bytes written and reported as one chunk
    pub chunk_size: usize,

    /// Minimum time between persisted progress checkpoints and progress events
    pub progress_interval_ms: u64,

    /// A transfer that receives nothing for this long is treated as interrupted
    pub stall_timeout_secs: u64,

    pub connect_timeout_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            save_path: dirs::download_dir().unwrap_or_else(|| PathBuf::from("./downloads")),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            chunk_size: 64 * 1024,
            progress_interval_ms: 1000,
            stall_timeout_secs: 30,
            connect_timeout_secs: 15,
        }
    }
}

impl DownloadSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// Strategy used by the merge stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategyKind {
    /// Remux both streams into one container with ffmpeg
    Ffmpeg,
    /// Append the audio bytes after the video bytes
    Concat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    pub strategy: MergeStrategyKind,

    /// ffmpeg executable, looked up on PATH when not absolute
    pub ffmpeg_path: PathBuf,

    /// Extension of the deliverable file
    pub extension: String,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            strategy: MergeStrategyKind::Ffmpeg,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            extension: "mp4".to_string(),
        }
    }
}
