//! Runs the video and audio transfers of one download as a single unit

use crate::download::transfer::{
    run_transfer, TransferEvent, TransferOutcome, TransferReport, TransferRequest,
};
use crate::error::{DownloadError, RegistryError};
use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Capacity of the engine -> coordinator event channel
const EVENT_BUFFER: usize = 64;

/// Why a running download was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    User,
    Shutdown,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::User => "paused by user",
            PauseReason::Shutdown => "paused for shutdown",
        }
    }
}

/// How a stream set ended
#[derive(Debug)]
pub enum SetOutcome {
    /// Every stream reached its expected size
    Complete,
    /// Stopped by request or by an interruption; resumable
    Paused(String),
    Failed(DownloadError),
    /// Progress could not be persisted
    Aborted(RegistryError),
}

#[derive(Debug)]
pub struct SetReport {
    /// Sum of the flushed offsets of every stream
    pub downloaded: u64,
    pub outcome: SetOutcome,
    pub streams: Vec<TransferReport>,
}

/// The transfers belonging to one download
pub struct StreamSet {
    id: String,
    client: Client,
    requests: Vec<TransferRequest>,
}

impl StreamSet {
    pub fn new(id: impl Into<String>, client: Client, requests: Vec<TransferRequest>) -> Self {
        Self {
            id: id.into(),
            client,
            requests,
        }
    }

    /// Bytes already on disk before this run starts
    pub fn downloaded(&self) -> u64 {
        self.requests.iter().map(|r| r.offset).sum()
    }

    pub fn total(&self) -> u64 {
        self.requests.iter().map(|r| r.expected_size).sum()
    }

    /// Run every stream concurrently until all finish.
    ///
    /// `on_progress` sees the aggregate byte count after every flushed chunk.
    /// Publishing a reason on `cancel` pauses the whole set; an interruption
    /// or failure of one stream stops the others too.
    pub async fn run<F>(
        self,
        mut cancel: watch::Receiver<Option<PauseReason>>,
        mut on_progress: F,
    ) -> SetReport
    where
        F: FnMut(u64) -> Result<(), RegistryError>,
    {
        let mut downloaded = self.downloaded();
        let stream_count = self.requests.len();

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for request in self.requests {
            let client = self.client.clone();
            let events = events_tx.clone();
            let stop = stop_rx.clone();
            tasks.spawn(async move {
                let report = run_transfer(&client, &request, &events, stop).await;
                let _ = events.send(TransferEvent::Finished(report)).await;
            });
        }
        drop(events_tx);

        let mut reports: Vec<TransferReport> = Vec::with_capacity(stream_count);
        let mut aborted: Option<RegistryError> = None;
        let mut cancel_open = true;
        let mut paused_by = *cancel.borrow_and_update();

        if paused_by.is_some() {
            let _ = stop_tx.send(true);
        }

        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(TransferEvent::Chunk { bytes, .. }) => {
                        downloaded += bytes;
                        if aborted.is_none() {
                            if let Err(err) = on_progress(downloaded) {
                                error!("Download {}: failed to record progress: {}", self.id, err);
                                aborted = Some(err);
                                let _ = stop_tx.send(true);
                            }
                        }
                    }
                    Some(TransferEvent::Finished(report)) => {
                        if report.outcome != TransferOutcome::Completed {
                            let _ = stop_tx.send(true);
                        }
                        reports.push(report);
                    }
                    None => break,
                },
                changed = cancel.changed(), if cancel_open && paused_by.is_none() => match changed {
                    Ok(()) => {
                        if let Some(reason) = *cancel.borrow_and_update() {
                            info!("Download {}: {}", self.id, reason.as_str());
                            paused_by = Some(reason);
                            let _ = stop_tx.send(true);
                        }
                    }
                    Err(_) => cancel_open = false,
                },
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Download {}: transfer task failed: {}", self.id, e);
            }
        }

        let reported: u64 = reports.iter().map(|r| r.offset).sum();
        if reported != downloaded {
            warn!(
                "Download {}: counted {} bytes but streams report {}",
                self.id, downloaded, reported
            );
        }

        let outcome = decide(aborted, &reports, stream_count, paused_by);
        debug!("Download {}: stream set finished with {:?}", self.id, outcome);

        SetReport {
            downloaded,
            outcome,
            streams: reports,
        }
    }
}

fn decide(
    aborted: Option<RegistryError>,
    reports: &[TransferReport],
    stream_count: usize,
    paused_by: Option<PauseReason>,
) -> SetOutcome {
    if let Some(err) = aborted {
        return SetOutcome::Aborted(err);
    }

    if let Some(err) = reports.iter().find_map(|r| match &r.outcome {
        TransferOutcome::Failed(err) => Some(err.clone()),
        _ => None,
    }) {
        return SetOutcome::Failed(err);
    }

    if reports.len() == stream_count
        && reports.iter().all(|r| r.outcome == TransferOutcome::Completed)
    {
        return SetOutcome::Complete;
    }

    if let Some(reason) = reports.iter().find_map(|r| match &r.outcome {
        TransferOutcome::Interrupted(reason) => Some(format!("{} stream interrupted: {}", r.kind, reason)),
        _ => None,
    }) {
        return SetOutcome::Paused(reason);
    }

    match paused_by {
        Some(reason) => SetOutcome::Paused(reason.as_str().to_string()),
        None => SetOutcome::Paused("transfer ended unexpectedly".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StreamKind;

    fn report(kind: StreamKind, offset: u64, outcome: TransferOutcome) -> TransferReport {
        TransferReport { kind, offset, outcome }
    }

    #[test]
    fn complete_needs_every_stream() {
        let reports = [report(StreamKind::Video, 10, TransferOutcome::Completed)];
        assert!(matches!(decide(None, &reports, 1, None), SetOutcome::Complete));
        assert!(matches!(decide(None, &reports, 2, None), SetOutcome::Paused(_)));
    }

    #[test]
    fn failure_wins_over_interruption() {
        let reports = [
            report(StreamKind::Video, 5, TransferOutcome::Interrupted("reset".into())),
            report(
                StreamKind::Audio,
                0,
                TransferOutcome::Failed(DownloadError::SizeMismatch("416".into())),
            ),
        ];
        assert!(matches!(
            decide(None, &reports, 2, None),
            SetOutcome::Failed(DownloadError::SizeMismatch(_))
        ));
    }

    #[test]
    fn interruption_pauses_with_reason() {
        let reports = [
            report(StreamKind::Video, 500, TransferOutcome::Interrupted("connection reset".into())),
            report(StreamKind::Audio, 100, TransferOutcome::Cancelled),
        ];
        match decide(None, &reports, 2, None) {
            SetOutcome::Paused(reason) => {
                assert_eq!(reason, "video stream interrupted: connection reset")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn user_pause_is_reported() {
        let reports = [
            report(StreamKind::Video, 500, TransferOutcome::Cancelled),
            report(StreamKind::Audio, 200, TransferOutcome::Completed),
        ];
        match decide(None, &reports, 2, Some(PauseReason::User)) {
            SetOutcome::Paused(reason) => assert_eq!(reason, "paused by user"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn shutdown_pause_is_reported() {
        let reports = [report(StreamKind::Video, 500, TransferOutcome::Cancelled)];
        match decide(None, &reports, 1, Some(PauseReason::Shutdown)) {
            SetOutcome::Paused(reason) => assert_eq!(reason, "paused for shutdown"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
