//! One download session: drives an entity from its current status to
//! `paused`, `completed` or `failed`

use crate::db::{Download, DownloadStatus};
use crate::download::coordinator::{PauseReason, SetOutcome, StreamSet};
use crate::download::manager::{DownloadEvent, DownloadManager, ManagerOptions};
use crate::download::merge::{self, StreamPart};
use crate::download::transfer::TransferRequest;
use crate::error::{DownloadError, ManagerResult};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Limits how often progress is persisted and published
struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
    started: Instant,
    start_bytes: u64,
}

impl ProgressThrottle {
    fn new(interval: Duration, start_bytes: u64) -> Self {
        Self {
            interval,
            last: None,
            started: Instant::now(),
            start_bytes,
        }
    }

    fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Average bytes per second since this session started transferring
    fn speed(&self, downloaded: u64) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (downloaded.saturating_sub(self.start_bytes) as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

enum Next {
    Merge(Download),
    Stop,
}

/// Run the session for `id` until it leaves `downloading`/`merging`.
///
/// Only registry failures are returned as errors; everything else ends up
/// as a status transition on the entity.
pub(crate) async fn run(
    manager: &DownloadManager,
    id: &str,
    cancel: watch::Receiver<Option<PauseReason>>,
) -> ManagerResult<()> {
    let Some(download) = manager.db().get_download(id)? else {
        warn!("Download {} disappeared before it could start", id);
        return Ok(());
    };
    let options = manager.options();

    let download = match download.status {
        DownloadStatus::Pending | DownloadStatus::Paused => {
            let reason = if download.status == DownloadStatus::Paused {
                format!("resumed at {} bytes", download.downloaded_size)
            } else {
                "transfer started".to_string()
            };
            let download = manager
                .db()
                .update_status(id, DownloadStatus::Downloading, None)?;
            manager.emit_status(id, DownloadStatus::Downloading, Some(reason));

            match transfer(manager, &options, download, cancel).await? {
                Next::Merge(download) => download,
                Next::Stop => return Ok(()),
            }
        }
        // Merge interrupted by a restart
        DownloadStatus::Merging => download,
        status => {
            warn!("Download {} is {}, not starting it", id, status);
            return Ok(());
        }
    };

    finish(manager, &options, download).await
}

async fn transfer(
    manager: &DownloadManager,
    options: &ManagerOptions,
    download: Download,
    cancel: watch::Receiver<Option<PauseReason>>,
) -> ManagerResult<Next> {
    let id = download.id.as_str();
    let db = manager.db();

    let mut requests = Vec::new();
    for kind in download.streams() {
        let temp_path = download.temp_file_path(kind);
        let offset = match TransferRequest::flushed_len(&temp_path).await {
            Ok(offset) => offset,
            Err(err) => return fail(manager, id, &err).map(|_| Next::Stop),
        };
        requests.push(TransferRequest {
            kind,
            url: download.stream_url(kind).unwrap_or_default().to_string(),
            referer: download.referer.clone(),
            offset,
            expected_size: download.stream_size(kind),
            temp_path,
            chunk_size: options.chunk_size,
            stall_timeout: options.stall_timeout,
        });
    }

    let set = StreamSet::new(id, manager.client().clone(), requests);
    let on_disk = set.downloaded();

    // Flushed bytes can only exceed the last checkpoint, never fall short of it
    if on_disk < download.downloaded_size {
        let err = DownloadError::Disk(format!(
            "partial files hold {} bytes but {} were recorded",
            on_disk, download.downloaded_size
        ));
        return fail(manager, id, &err).map(|_| Next::Stop);
    }
    if on_disk > download.total_size {
        let err = DownloadError::SizeMismatch(format!(
            "partial files hold {} bytes, more than the expected {}",
            on_disk, download.total_size
        ));
        return fail(manager, id, &err).map(|_| Next::Stop);
    }
    if on_disk > download.downloaded_size {
        db.update_progress(id, on_disk)?;
    }

    info!(
        "Transferring {} ({}): {}/{} bytes on disk",
        id, download.file_name, on_disk, download.total_size
    );

    let total = download.total_size;
    let mut throttle = ProgressThrottle::new(options.progress_interval, on_disk);
    let report = set
        .run(cancel, |downloaded| {
            if throttle.ready() {
                db.update_progress(id, downloaded)?;
                manager.emit(DownloadEvent::Progress {
                    id: id.to_string(),
                    downloaded_size: downloaded,
                    total_size: total,
                    speed: throttle.speed(downloaded),
                });
            }
            Ok(())
        })
        .await;

    // Final checkpoint with the exact flushed byte count
    let downloaded = report.downloaded;
    let checkpoint = || -> ManagerResult<()> {
        db.update_progress(id, downloaded)?;
        manager.emit(DownloadEvent::Progress {
            id: id.to_string(),
            downloaded_size: downloaded,
            total_size: total,
            speed: throttle.speed(downloaded),
        });
        Ok(())
    };

    match report.outcome {
        SetOutcome::Aborted(err) => Err(err.into()),
        SetOutcome::Complete => {
            checkpoint()?;
            let download = db.update_status(id, DownloadStatus::Merging, None)?;
            manager.emit_status(
                id,
                DownloadStatus::Merging,
                Some("all streams downloaded".to_string()),
            );
            Ok(Next::Merge(download))
        }
        SetOutcome::Paused(reason) => {
            checkpoint()?;
            info!("Download {} paused at {} bytes: {}", id, downloaded, reason);
            db.update_status(id, DownloadStatus::Paused, Some(&reason))?;
            manager.emit_status(id, DownloadStatus::Paused, Some(reason));
            Ok(Next::Stop)
        }
        SetOutcome::Failed(err) => {
            checkpoint()?;
            fail(manager, id, &err).map(|_| Next::Stop)
        }
    }
}

/// Merge (or move) the finished streams into the deliverable
async fn finish(
    manager: &DownloadManager,
    options: &ManagerOptions,
    download: Download,
) -> ManagerResult<()> {
    let parts: Vec<StreamPart> = download
        .streams()
        .into_iter()
        .map(|kind| StreamPart {
            kind,
            path: download.temp_file_path(kind),
            expected_size: download.stream_size(kind),
        })
        .collect();
    let target = download
        .save_path
        .join(format!("{}.{}", download.file_name, options.extension));

    match merge::finalize(manager.merger(), &parts, &target).await {
        Ok(path) => {
            manager.db().complete_download(&download.id, &path)?;
            info!("Download {} completed: {}", download.id, path.display());
            manager.emit_status(
                &download.id,
                DownloadStatus::Completed,
                Some(format!("saved to {}", path.display())),
            );
            Ok(())
        }
        Err(err) => fail(manager, &download.id, &err),
    }
}

fn fail(manager: &DownloadManager, id: &str, err: &DownloadError) -> ManagerResult<()> {
    let reason = err.to_string();
    warn!("Download {} failed: {}", id, reason);
    manager
        .db()
        .update_status(id, DownloadStatus::Failed, Some(&reason))?;
    manager.emit_status(id, DownloadStatus::Failed, Some(reason));
    Ok(())
}
