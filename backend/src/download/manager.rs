//! Download manager: owns the registry, schedules downloads under the
//! concurrency limit and publishes progress and status events

use crate::config::{DownloadSettings, Settings};
use crate::db::{Database, Download, DownloadStatus};
use crate::download::coordinator::PauseReason;
use crate::download::merge::{merger_for, MergeStrategy};
use crate::download::probe::probe_size;
use crate::download::{extract_filename, sanitize_file_name, session};
use crate::error::{ManagerError, ManagerResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

/// Events published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Progress {
        id: String,
        downloaded_size: u64,
        total_size: u64,
        /// Average bytes per second since the transfer (re)started
        speed: u64,
    },
    StatusChanged {
        id: String,
        status: DownloadStatus,
        reason: Option<String>,
    },
    Removed {
        id: String,
    },
}

/// A request to download one media item
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDownload {
    pub video_url: String,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub referer: String,
    #[serde(default)]
    pub file_name: String,
    /// Directory for the deliverable; the configured default when absent
    #[serde(default)]
    pub save_path: Option<PathBuf>,
    /// Known stream sizes; probed from the server when absent
    #[serde(default)]
    pub video_size: Option<u64>,
    #[serde(default)]
    pub audio_size: Option<u64>,
}

/// Runtime knobs of the manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub max_concurrent: usize,
    pub save_path: PathBuf,
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub stall_timeout: Duration,
    pub extension: String,
}

impl ManagerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent_downloads,
            save_path: settings.downloads.save_path.clone(),
            chunk_size: settings.downloads.chunk_size,
            progress_interval: settings.downloads.progress_interval(),
            stall_timeout: settings.downloads.stall_timeout(),
            extension: settings.merge.extension.clone(),
        }
    }
}

/// HTTP client shared by every transfer
pub fn build_client(settings: &DownloadSettings) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(settings.user_agent.clone())
        .connect_timeout(settings.connect_timeout())
        .build()
}

/// Download statistics
#[derive(Debug, Clone, Serialize)]
pub struct DownloadStats {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

/// What `recover` found in the registry
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub paused: usize,
    pub queued: usize,
}

/// Handle to a running session
struct ActiveDownload {
    cancel: watch::Sender<Option<PauseReason>>,
    /// Flips to true once the session has persisted its final status
    done: watch::Receiver<bool>,
}

/// Inner state that cannot be cloned directly
struct DownloadManagerInner {
    db: Database,
    client: reqwest::Client,
    merger: Arc<dyn MergeStrategy>,
    options: RwLock<ManagerOptions>,

    /// Running sessions (id -> cancel handle)
    active: Mutex<HashMap<String, ActiveDownload>>,

    /// Downloads waiting for a slot, oldest first
    queue: Mutex<VecDeque<String>>,

    /// Permits still to be retired after the limit was lowered
    pending_reduction: Mutex<usize>,
}

/// Download manager that handles concurrent downloads and queuing
#[derive(Clone)]
pub struct DownloadManager {
    /// One permit per download allowed in `downloading`/`merging`
    semaphore: Arc<Semaphore>,

    /// Inner state wrapped in Arc
    inner: Arc<DownloadManagerInner>,

    /// Broadcast channel for progress and status events
    events_tx: broadcast::Sender<DownloadEvent>,
}

impl DownloadManager {
    /// Create a new download manager
    pub fn new(
        db: Database,
        client: reqwest::Client,
        merger: Arc<dyn MergeStrategy>,
        options: ManagerOptions,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(1000);

        Self {
            semaphore: Arc::new(Semaphore::new(options.max_concurrent)),
            inner: Arc::new(DownloadManagerInner {
                db,
                client,
                merger,
                options: RwLock::new(options),
                active: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                pending_reduction: Mutex::new(0),
            }),
            events_tx,
        }
    }

    /// Build a manager from the application settings
    pub fn from_settings(db: Database, settings: &Settings) -> reqwest::Result<Self> {
        let client = build_client(&settings.downloads)?;
        Ok(Self::new(
            db,
            client,
            merger_for(&settings.merge),
            ManagerOptions::from_settings(settings),
        ))
    }

    /// Subscribe to progress and status events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: DownloadEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn emit_status(&self, id: &str, status: DownloadStatus, reason: Option<String>) {
        self.emit(DownloadEvent::StatusChanged {
            id: id.to_string(),
            status,
            reason,
        });
    }

    pub(crate) fn db(&self) -> &Database {
        &self.inner.db
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub(crate) fn merger(&self) -> &dyn MergeStrategy {
        self.inner.merger.as_ref()
    }

    pub fn options(&self) -> ManagerOptions {
        self.inner.options.read().clone()
    }

    /// Change the default save path for new downloads
    pub fn set_save_path(&self, save_path: PathBuf) {
        self.inner.options.write().save_path = save_path;
    }

    // ============ Commands ============

    /// Register a new download and schedule it. Returns its id.
    pub async fn start_download(&self, request: NewDownload) -> ManagerResult<String> {
        validate_url(&request.video_url)?;
        let audio_url = request.audio_url.filter(|url| !url.trim().is_empty());
        if let Some(url) = &audio_url {
            validate_url(url)?;
        }

        let options = self.options();

        let video_size = match request.video_size.filter(|size| *size > 0) {
            Some(size) => size,
            None => self.probe(&request.video_url, &request.referer).await?,
        };
        let audio_size = match (&audio_url, request.audio_size.filter(|size| *size > 0)) {
            (None, _) => 0,
            (Some(_), Some(size)) => size,
            (Some(url), None) => self.probe(url, &request.referer).await?,
        };
        if video_size == 0 {
            return Err(ManagerError::InvalidRequest("video stream is empty".into()));
        }

        let file_name = if request.file_name.trim().is_empty() {
            extract_filename(&request.video_url)
        } else {
            request.file_name
        };

        let download = Download::new(
            request.video_url,
            audio_url,
            request.referer,
            sanitize_file_name(&file_name),
            request.save_path.unwrap_or(options.save_path),
            video_size,
            audio_size,
        );
        let id = download.id.clone();

        self.inner.db.insert_download(&download)?;
        info!(
            "Added download {} ({}, {} bytes)",
            id, download.file_name, download.total_size
        );
        self.emit_status(&id, DownloadStatus::Pending, Some("waiting for a download slot".into()));

        self.enqueue(id.clone());
        self.pump();

        Ok(id)
    }

    /// Stop an active download at the next chunk boundary and wait until
    /// its offsets are persisted. Returns the record after the pause.
    pub async fn pause_download(&self, id: &str) -> ManagerResult<Download> {
        let download = self.get_download(id)?;
        if download.status != DownloadStatus::Downloading {
            return Err(ManagerError::InvalidState {
                id: id.to_string(),
                status: download.status,
                operation: "pause",
            });
        }

        match self.cancel_active(id, PauseReason::User) {
            Some(done) => wait_done(done).await,
            None => {
                return Err(ManagerError::InvalidState {
                    id: id.to_string(),
                    status: download.status,
                    operation: "pause",
                })
            }
        }

        self.get_download(id)
    }

    /// Schedule a paused download again. Returns true if it has to wait for
    /// a free slot.
    pub async fn resume_download(&self, id: &str) -> ManagerResult<bool> {
        let download = self.get_download(id)?;
        if download.status != DownloadStatus::Paused {
            return Err(ManagerError::InvalidState {
                id: id.to_string(),
                status: download.status,
                operation: "resume",
            });
        }

        // A session that was told to pause may still be winding down
        let stopping = self
            .inner
            .active
            .lock()
            .get(id)
            .filter(|a| a.cancel.borrow().is_some())
            .map(|a| a.done.clone());
        if let Some(done) = stopping {
            wait_done(done).await;
            let download = self.get_download(id)?;
            if download.status != DownloadStatus::Paused {
                return Err(ManagerError::InvalidState {
                    id: id.to_string(),
                    status: download.status,
                    operation: "resume",
                });
            }
        }

        {
            // Queue before active, the same order `pump` takes them in
            let mut queue = self.inner.queue.lock();
            if queue.iter().any(|queued| queued == id) {
                return Ok(true);
            }
            if self.inner.active.lock().contains_key(id) {
                // An earlier resume is already running it
                return Ok(false);
            }
            queue.push_back(id.to_string());
        }

        info!("Resuming download {} at {} bytes", id, download.downloaded_size);
        self.pump();

        Ok(self.is_queued(id))
    }

    /// Remove a download, cancelling it first if it is running. Partial
    /// files are deleted; a finished deliverable is kept.
    pub async fn delete_download(&self, id: &str) -> ManagerResult<()> {
        let download = self.get_download(id)?;

        self.inner.queue.lock().retain(|queued| queued != id);
        if let Some(done) = self.cancel_active(id, PauseReason::User) {
            wait_done(done).await;
        }

        self.inner.db.delete_download(id)?;

        for kind in download.streams() {
            let path = download.temp_file_path(kind);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        info!("Deleted download {} ({})", id, download.file_name);
        self.emit(DownloadEvent::Removed { id: id.to_string() });
        Ok(())
    }

    /// All downloads, newest first
    pub fn list_downloads(&self) -> ManagerResult<Vec<Download>> {
        Ok(self.inner.db.get_all_downloads()?)
    }

    pub fn list_by_status(&self, status: DownloadStatus) -> ManagerResult<Vec<Download>> {
        Ok(self.inner.db.get_downloads_by_status(status)?)
    }

    pub fn search_downloads(&self, text: &str) -> ManagerResult<Vec<Download>> {
        Ok(self.inner.db.search_downloads(text)?)
    }

    pub fn get_download(&self, id: &str) -> ManagerResult<Download> {
        self.inner
            .db
            .get_download(id)?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    // ============ Lifecycle ============

    /// Bring the registry back in line after a restart.
    ///
    /// Downloads left `downloading` become `paused`; they are not restarted
    /// until resumed. Pending downloads and interrupted merges are queued.
    pub fn recover(&self) -> ManagerResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for download in self.inner.db.mark_interrupted("interrupted by restart")? {
            warn!(
                "Download {} was interrupted at {}/{} bytes, now paused",
                download.id, download.downloaded_size, download.total_size
            );
            self.emit_status(&download.id, DownloadStatus::Paused, download.error_message);
            report.paused += 1;
        }

        for download in self.inner.db.get_unfinished_downloads()? {
            if matches!(download.status, DownloadStatus::Pending | DownloadStatus::Merging) {
                self.enqueue(download.id);
                report.queued += 1;
            }
        }

        if report.paused > 0 || report.queued > 0 {
            info!(
                "Recovered downloads: {} paused, {} queued",
                report.paused, report.queued
            );
        }
        self.pump();

        Ok(report)
    }

    /// Pause every running transfer so its progress is on disk. Queued
    /// downloads stay pending for the next start.
    pub async fn shutdown(&self) {
        self.inner.queue.lock().clear();

        let ids: Vec<String> = self.inner.active.lock().keys().cloned().collect();
        let waits: Vec<_> = ids
            .iter()
            .filter_map(|id| self.cancel_active(id, PauseReason::Shutdown))
            .collect();
        for done in waits {
            wait_done(done).await;
        }

        info!("Download manager stopped ({} sessions paused)", ids.len());
    }

    // ============ Scheduling ============

    /// Add a download to the queue
    fn enqueue(&self, id: String) {
        let mut queue = self.inner.queue.lock();
        if !queue.contains(&id) {
            queue.push_back(id);
        }
    }

    pub fn is_queued(&self, id: &str) -> bool {
        self.inner.queue.lock().iter().any(|queued| queued == id)
    }

    /// Check if a download is active
    pub fn is_active(&self, id: &str) -> bool {
        self.inner.active.lock().contains_key(id)
    }

    /// Start queued downloads while permits are available
    fn pump(&self) {
        loop {
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            // Registered as active while the queue is still locked, so a
            // scheduled id is always in one of the two
            let mut queue = self.inner.queue.lock();
            match queue.pop_front() {
                Some(id) => self.spawn_session(id, permit),
                None => return,
            }
        }
    }

    fn spawn_session(&self, id: String, permit: OwnedSemaphorePermit) {
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let (done_tx, done_rx) = watch::channel(false);

        self.inner.active.lock().insert(
            id.clone(),
            ActiveDownload {
                cancel: cancel_tx,
                done: done_rx,
            },
        );

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session::run(&manager, &id, cancel_rx).await {
                error!("Download {} stopped: {}", id, e);
            }

            manager.inner.active.lock().remove(&id);
            manager.release(permit);
            let _ = done_tx.send(true);

            // Try to start next queued download
            manager.pump();
        });
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        let mut pending = self.inner.pending_reduction.lock();
        if *pending > 0 {
            *pending -= 1;
            permit.forget();
        }
    }

    /// Ask a running session to stop; returns its completion signal
    fn cancel_active(&self, id: &str, reason: PauseReason) -> Option<watch::Receiver<bool>> {
        let active = self.inner.active.lock();
        let download = active.get(id)?;
        let _ = download.cancel.send(Some(reason));
        Some(download.done.clone())
    }

    /// Get active download count
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Get queue length
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Update max concurrent downloads
    pub fn set_max_concurrent(&self, max: usize) {
        let old_max = {
            let mut options = self.inner.options.write();
            std::mem::replace(&mut options.max_concurrent, max)
        };

        if max > old_max {
            let mut add = max - old_max;
            let mut pending = self.inner.pending_reduction.lock();
            let cancelled = add.min(*pending);
            *pending -= cancelled;
            add -= cancelled;
            drop(pending);
            self.semaphore.add_permits(add);
        } else if max < old_max {
            // Idle permits go now, busy ones when their session ends
            let reduce = old_max - max;
            let forgotten = self.semaphore.forget_permits(reduce);
            *self.inner.pending_reduction.lock() += reduce - forgotten;
        }

        info!("Max concurrent downloads: {} -> {}", old_max, max);
        self.pump();
    }

    /// Get current statistics
    pub fn stats(&self) -> DownloadStats {
        DownloadStats {
            active: self.active_count(),
            queued: self.queue_len(),
            max_concurrent: self.inner.options.read().max_concurrent,
        }
    }

    async fn probe(&self, url: &str, referer: &str) -> ManagerResult<u64> {
        let timeout = self.inner.options.read().stall_timeout;
        probe_size(&self.inner.client, url, referer, timeout)
            .await
            .map_err(|source| ManagerError::Probe {
                url: url.to_string(),
                source,
            })
    }
}

fn validate_url(url: &str) -> ManagerResult<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| ManagerError::InvalidRequest(format!("invalid URL `{url}`: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ManagerError::InvalidRequest(format!(
            "unsupported URL scheme `{scheme}`"
        ))),
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    // An error means the session task is gone, which is just as final
    let _ = done.wait_for(|finished| *finished).await;
}
