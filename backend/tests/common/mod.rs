//! Shared helpers: an in-process media server with range support and
//! injectable faults, plus a manager wired to it.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, StreamExt};
use tokio::net::TcpListener;

use vibe_media::db::{Database, Download, DownloadStatus};
use vibe_media::download::{
    ConcatMerger, DownloadEvent, DownloadManager, ManagerOptions, MergeStrategy,
};

/// Misbehaviour applied to the next GET of a file
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Send this many body bytes, then drop the connection
    CutAfter(usize),
    /// Send this many body bytes, then go silent
    StallAfter(usize),
    /// Answer 200 with the whole body regardless of Range
    IgnoreRange,
    /// Answer 416
    RangeNotSatisfiable,
}

#[derive(Default)]
struct ServerState {
    files: Mutex<HashMap<String, (Vec<u8>, VecDeque<Fault>)>>,
    /// (file, Range header) of every request, in arrival order
    requests: Mutex<Vec<(String, Option<String>)>>,
}

pub struct MediaServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MediaServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/media/{name}", get(serve_file))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            state,
            _handle: handle,
        }
    }

    /// Publish `body` under `name`; returns its URL
    pub fn add(&self, name: &str, body: Vec<u8>) -> String {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), (body, VecDeque::new()));
        self.url(name)
    }

    /// Queue a fault for the next request of `name`
    pub fn fault(&self, name: &str, fault: Fault) {
        if let Some((_, faults)) = self.state.files.lock().unwrap().get_mut(name) {
            faults.push_back(fault);
        }
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://{}/media/{}", self.addr, name)
    }

    /// Range headers received for `name`, oldest first
    pub fn ranges(&self, name: &str) -> Vec<Option<String>> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(file, _)| file == name)
            .map(|(_, range)| range.clone())
            .collect()
    }
}

async fn serve_file(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state
        .requests
        .lock()
        .unwrap()
        .push((name.clone(), range.clone()));

    let (body, fault) = {
        let mut files = state.files.lock().unwrap();
        match files.get_mut(&name) {
            Some((body, faults)) => (body.clone(), faults.pop_front()),
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    };
    let total = body.len();

    if let Some(Fault::RangeNotSatisfiable) = fault {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", total))],
        )
            .into_response();
    }

    let parsed = match (&fault, range.as_deref().and_then(parse_range)) {
        (Some(Fault::IgnoreRange), _) | (_, None) => None,
        (_, Some(range)) => Some(range),
    };

    let (status, start, slice) = match parsed {
        Some((start, end)) => {
            if start >= total {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            let end = end.unwrap_or(total - 1).min(total - 1);
            (StatusCode::PARTIAL_CONTENT, start, body[start..=end].to_vec())
        }
        None => (StatusCode::OK, 0, body.clone()),
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, slice.len());
    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, start + slice.len() - 1, total),
        );
    }

    let body = match fault {
        Some(Fault::CutAfter(n)) => {
            let head = slice[..n.min(slice.len())].to_vec();
            let sent = stream::iter([Ok::<_, std::io::Error>(head)]);
            let cut = stream::once(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection dropped",
                ))
            });
            Body::from_stream(sent.chain(cut))
        }
        Some(Fault::StallAfter(n)) => {
            let head = slice[..n.min(slice.len())].to_vec();
            let sent = stream::iter([Ok::<_, std::io::Error>(head)]);
            Body::from_stream(sent.chain(stream::pending()))
        }
        _ => Body::from(slice),
    };

    response.body(body).unwrap()
}

/// `bytes=START-` or `bytes=START-END`
fn parse_range(value: &str) -> Option<(usize, Option<usize>)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

/// Deterministic test payload, distinct per `seed`
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed)
        .collect()
}

pub fn options(max_concurrent: usize, save_path: &Path) -> ManagerOptions {
    ManagerOptions {
        max_concurrent,
        save_path: save_path.to_path_buf(),
        chunk_size: 64,
        progress_interval: Duration::ZERO,
        stall_timeout: Duration::from_secs(10),
        extension: "mp4".to_string(),
    }
}

/// Client that never routes loopback traffic through a proxy
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Manager with the concat merger so no ffmpeg is needed
pub fn manager(db: Database, max_concurrent: usize, save_path: &Path) -> DownloadManager {
    manager_with(db, options(max_concurrent, save_path), Arc::new(ConcatMerger))
}

pub fn manager_with(
    db: Database,
    options: ManagerOptions,
    merger: Arc<dyn MergeStrategy>,
) -> DownloadManager {
    DownloadManager::new(db, client(), merger, options)
}

/// Poll the registry until `id` reaches `status`
pub async fn wait_for_status(
    manager: &DownloadManager,
    id: &str,
    status: DownloadStatus,
) -> Download {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let download = manager.get_download(id).unwrap();
        if download.status == status {
            return download;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "download {} stuck in {} waiting for {} ({:?})",
            id,
            download.status,
            status,
            download.error_message
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll the registry until `id` has checkpointed `bytes`
pub async fn wait_for_progress(manager: &DownloadManager, id: &str, bytes: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while manager.get_download(id).unwrap().downloaded_size < bytes {
        assert!(
            tokio::time::Instant::now() < deadline,
            "download {} never reached {} bytes",
            id,
            bytes
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Status events received until `id` reports `status`
pub async fn statuses_until(
    events: &mut tokio::sync::broadcast::Receiver<DownloadEvent>,
    id: &str,
    status: DownloadStatus,
) -> Vec<(String, DownloadStatus)> {
    let mut statuses = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(15), events.recv())
            .await
            .expect("timed out waiting for a status event")
            .expect("event channel closed or lagged");
        if let DownloadEvent::StatusChanged {
            id: event_id,
            status: event_status,
            ..
        } = event
        {
            let reached = event_id == id && event_status == status;
            statuses.push((event_id, event_status));
            if reached {
                return statuses;
            }
        }
    }
}
