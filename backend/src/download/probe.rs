//! Stream size discovery

use crate::error::DownloadError;
use reqwest::header::{CONTENT_RANGE, RANGE, REFERER};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// A parsed `Content-Range: bytes start-end/total` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let range = Self {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
            total: total.trim().parse().ok()?,
        };
        (range.start <= range.end && range.end < range.total).then_some(range)
    }
}

/// Ask the server for the full size of a stream.
///
/// Requests the first byte only and reads the total from `Content-Range`;
/// servers that ignore the range answer `200` with the full length instead.
pub async fn probe_size(
    client: &Client,
    url: &str,
    referer: &str,
    timeout: Duration,
) -> Result<u64, DownloadError> {
    let mut request = client.get(url).header(RANGE, "bytes=0-0").timeout(timeout);
    if !referer.is_empty() {
        request = request.header(REFERER, referer);
    }

    let response = request.send().await?;
    let size = match response.status() {
        StatusCode::PARTIAL_CONTENT => response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(ContentRange::parse)
            .map(|range| range.total)
            .ok_or_else(|| {
                DownloadError::SizeMismatch("missing or invalid Content-Range header".to_string())
            })?,
        StatusCode::OK => response.content_length().ok_or_else(|| {
            DownloadError::SizeMismatch("no content length in response".to_string())
        })?,
        status => return Err(DownloadError::Network(format!("HTTP {status} while probing"))),
    };

    debug!("Probed {} -> {} bytes", url, size);
    Ok(size)
}
