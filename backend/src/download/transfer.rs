//! Chunked transfer engine: one resumable range download of one stream

use crate::db::StreamKind;
use crate::download::probe::ContentRange;
use crate::error::DownloadError;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE, REFERER};
use reqwest::{Client, Response, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Everything needed to fetch `[offset, expected_size)` of one stream
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub kind: StreamKind,
    pub url: String,
    pub referer: String,
    /// Next byte to request; must equal the length of `temp_path`
    pub offset: u64,
    pub expected_size: u64,
    pub temp_path: PathBuf,
    pub chunk_size: usize,
    pub stall_timeout: Duration,
}

impl TransferRequest {
    /// Resume point of a partial file: its current length, or zero if absent
    pub async fn flushed_len(path: &std::path::Path) -> Result<u64, DownloadError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Messages an engine sends to its coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// `bytes` more bytes of `kind` were written and flushed
    Chunk { kind: StreamKind, bytes: u64 },
    Finished(TransferReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    /// Stopped on request after the last flushed chunk
    Cancelled,
    /// Connection failure or stall; resumable from `offset`
    Interrupted(String),
    Failed(DownloadError),
}

/// Final state of one engine run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub kind: StreamKind,
    /// Bytes of the stream flushed to the partial file
    pub offset: u64,
    pub outcome: TransferOutcome,
}

/// Transfer one stream, appending to its partial file.
///
/// A chunk event is sent only after the bytes are flushed, so `offset` in
/// the report never counts data that is not on disk. Setting `stop` to true
/// ends the transfer at the next chunk boundary.
pub async fn run_transfer(
    client: &Client,
    request: &TransferRequest,
    events: &mpsc::Sender<TransferEvent>,
    mut stop: watch::Receiver<bool>,
) -> TransferReport {
    let mut offset = request.offset;
    let outcome = match transfer(client, request, &mut offset, events, &mut stop).await {
        Ok(outcome) => outcome,
        Err(err) if err.is_retryable() => TransferOutcome::Interrupted(err.to_string()),
        Err(err) => TransferOutcome::Failed(err),
    };

    match &outcome {
        TransferOutcome::Completed => {
            info!("{} stream complete: {} bytes", request.kind, offset)
        }
        TransferOutcome::Cancelled => {
            info!("{} stream stopped at {}/{}", request.kind, offset, request.expected_size)
        }
        TransferOutcome::Interrupted(reason) => warn!(
            "{} stream interrupted at {}/{}: {}",
            request.kind, offset, request.expected_size, reason
        ),
        TransferOutcome::Failed(err) => warn!(
            "{} stream failed at {}/{}: {}",
            request.kind, offset, request.expected_size, err
        ),
    }

    TransferReport {
        kind: request.kind,
        offset,
        outcome,
    }
}

async fn transfer(
    client: &Client,
    request: &TransferRequest,
    offset: &mut u64,
    events: &mpsc::Sender<TransferEvent>,
    stop: &mut watch::Receiver<bool>,
) -> Result<TransferOutcome, DownloadError> {
    if *offset > request.expected_size {
        return Err(DownloadError::SizeMismatch(format!(
            "{} partial file has {} bytes but the stream is {} bytes",
            request.kind, offset, request.expected_size
        )));
    }

    let mut file = open_for_append(request).await?;

    if *offset == request.expected_size {
        return Ok(TransferOutcome::Completed);
    }
    if *stop.borrow() {
        return Ok(TransferOutcome::Cancelled);
    }

    debug!(
        "Requesting {} bytes {}-{} from {}",
        request.kind,
        offset,
        request.expected_size - 1,
        request.url
    );

    let response = tokio::select! {
        biased;
        _ = stop_requested(stop) => return Ok(TransferOutcome::Cancelled),
        response = tokio::time::timeout(request.stall_timeout, request_range(client, request, *offset)) => {
            response.map_err(|_| DownloadError::Network(format!(
                "no response within {}s",
                request.stall_timeout.as_secs()
            )))??
        }
    };
    check_response(&response, request, *offset)?;

    let mut stream = response.bytes_stream();

    while *offset < request.expected_size {
        if *stop.borrow() {
            file.sync_data().await?;
            return Ok(TransferOutcome::Cancelled);
        }

        let next = tokio::select! {
            biased;
            _ = stop_requested(stop) => {
                file.sync_data().await?;
                return Ok(TransferOutcome::Cancelled);
            }
            next = tokio::time::timeout(request.stall_timeout, stream.next()) => next,
        };

        let bytes = match next {
            Err(_) => {
                return Err(DownloadError::Network(format!(
                    "no data received for {}s",
                    request.stall_timeout.as_secs()
                )))
            }
            Ok(None) => {
                return Err(DownloadError::Network(format!(
                    "connection closed at byte {} of {}",
                    offset, request.expected_size
                )))
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(bytes))) => bytes,
        };

        let remaining = (request.expected_size - *offset) as usize;
        let usable = &bytes[..bytes.len().min(remaining)];

        for piece in usable.chunks(request.chunk_size.max(1)) {
            file.write_all(piece).await?;
            file.flush().await?;
            *offset += piece.len() as u64;

            let event = TransferEvent::Chunk {
                kind: request.kind,
                bytes: piece.len() as u64,
            };
            if events.send(event).await.is_err() {
                // Nobody is listening any more
                file.sync_data().await?;
                return Ok(TransferOutcome::Cancelled);
            }
        }

        if bytes.len() > remaining {
            file.sync_data().await?;
            return Err(DownloadError::SizeMismatch(format!(
                "server sent more than the expected {} bytes of {}",
                request.expected_size, request.kind
            )));
        }
    }

    file.sync_data().await?;
    Ok(TransferOutcome::Completed)
}

/// Open the partial file for appending, checking it ends where we resume
async fn open_for_append(request: &TransferRequest) -> Result<File, DownloadError> {
    if let Some(parent) = request.temp_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&request.temp_path)
        .await?;

    let len = file.metadata().await?.len();
    if len != request.offset {
        return Err(DownloadError::Disk(format!(
            "{} holds {} bytes but the transfer resumes at {}",
            request.temp_path.display(),
            len,
            request.offset
        )));
    }

    Ok(file)
}

async fn request_range(
    client: &Client,
    request: &TransferRequest,
    offset: u64,
) -> Result<Response, DownloadError> {
    let mut builder = client.get(&request.url).header(
        RANGE,
        format!("bytes={}-{}", offset, request.expected_size - 1),
    );
    if !request.referer.is_empty() {
        builder = builder.header(REFERER, &request.referer);
    }
    Ok(builder.send().await?)
}

fn check_response(
    response: &Response,
    request: &TransferRequest,
    offset: u64,
) -> Result<(), DownloadError> {
    match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            let range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(ContentRange::parse)
                .ok_or_else(|| {
                    DownloadError::SizeMismatch("missing or invalid Content-Range header".into())
                })?;

            if range.total != request.expected_size {
                return Err(DownloadError::SizeMismatch(format!(
                    "{} is {} bytes on the server, expected {}",
                    request.kind, range.total, request.expected_size
                )));
            }
            if range.start != offset {
                return Err(DownloadError::SizeMismatch(format!(
                    "server answered from byte {} instead of {}",
                    range.start, offset
                )));
            }
            Ok(())
        }
        // Range ignored: only usable when starting from zero with the right length
        StatusCode::OK if offset == 0 && response.content_length() == Some(request.expected_size) => {
            Ok(())
        }
        StatusCode::OK => Err(DownloadError::SizeMismatch(format!(
            "server ignored the range request for {} at byte {}",
            request.kind, offset
        ))),
        StatusCode::RANGE_NOT_SATISFIABLE => Err(DownloadError::SizeMismatch(format!(
            "range {}-{} not satisfiable for {}",
            offset,
            request.expected_size - 1,
            request.kind
        ))),
        status => Err(DownloadError::Network(format!("HTTP {status}"))),
    }
}

/// Resolves once a stop has been requested or the controller is gone
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
