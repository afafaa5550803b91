mod common;

use std::path::Path;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use common::{client, payload, Fault, MediaServer};
use vibe_media::db::StreamKind;
use vibe_media::download::transfer::{run_transfer, TransferOutcome, TransferRequest};
use vibe_media::download::{SetOutcome, StreamSet};
use vibe_media::error::DownloadError;

fn request(url: String, temp_path: &Path, offset: u64, expected_size: u64) -> TransferRequest {
    TransferRequest {
        kind: StreamKind::Video,
        url,
        referer: "https://www.example.com/video/1".to_string(),
        offset,
        expected_size,
        temp_path: temp_path.to_path_buf(),
        chunk_size: 64,
        stall_timeout: Duration::from_secs(10),
    }
}

#[tokio::test]
async fn downloads_whole_stream() {
    let server = MediaServer::start().await;
    let body = payload(1000, 7);
    let url = server.add("v.m4s", body.clone());
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("v.part");

    let (tx, mut rx) = mpsc::channel(1024);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let report = run_transfer(&client(), &request(url, &temp, 0, 1000), &tx, stop_rx).await;

    assert_eq!(report.outcome, TransferOutcome::Completed);
    assert_eq!(report.offset, 1000);
    assert_eq!(std::fs::read(&temp).unwrap(), body);
    assert_eq!(server.ranges("v.m4s"), vec![Some("bytes=0-999".to_string())]);

    drop(tx);
    let mut flushed = 0;
    while let Some(event) = rx.recv().await {
        if let vibe_media::download::transfer::TransferEvent::Chunk { bytes, .. } = event {
            assert!(bytes <= 64);
            flushed += bytes;
        }
    }
    assert_eq!(flushed, 1000);
}

#[tokio::test]
async fn resumes_from_partial_file() {
    let server = MediaServer::start().await;
    let body = payload(1000, 3);
    let url = server.add("v.m4s", body.clone());
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("v.part");
    std::fs::write(&temp, &body[..400]).unwrap();

    let (tx, _rx) = mpsc::channel(1024);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let report = run_transfer(&client(), &request(url, &temp, 400, 1000), &tx, stop_rx).await;

    assert_eq!(report.outcome, TransferOutcome::Completed);
    assert_eq!(server.ranges("v.m4s"), vec![Some("bytes=400-999".to_string())]);
    assert_eq!(std::fs::read(&temp).unwrap(), body);
}

#[tokio::test]
async fn full_body_for_a_partial_request_is_rejected() {
    let server = MediaServer::start().await;
    let body = payload(1000, 1);
    let url = server.add("v.m4s", body.clone());
    server.fault("v.m4s", Fault::IgnoreRange);
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("v.part");
    std::fs::write(&temp, &body[..100]).unwrap();

    let (tx, _rx) = mpsc::channel(1024);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let report = run_transfer(&client(), &request(url, &temp, 100, 1000), &tx, stop_rx).await;

    assert!(matches!(
        report.outcome,
        TransferOutcome::Failed(DownloadError::SizeMismatch(_))
    ));
    assert_eq!(report.offset, 100);
    assert_eq!(std::fs::read(&temp).unwrap(), &body[..100]);
}

#[tokio::test]
async fn range_not_satisfiable_is_a_size_mismatch() {
    let server = MediaServer::start().await;
    let url = server.add("v.m4s", payload(1000, 1));
    server.fault("v.m4s", Fault::RangeNotSatisfiable);
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("v.part");

    let (tx, _rx) = mpsc::channel(1024);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let report = run_transfer(&client(), &request(url, &temp, 0, 1000), &tx, stop_rx).await;

    assert!(matches!(
        report.outcome,
        TransferOutcome::Failed(DownloadError::SizeMismatch(_))
    ));
}

#[tokio::test]
async fn wrong_total_size_is_a_size_mismatch() {
    let server = MediaServer::start().await;
    let url = server.add("v.m4s", payload(900, 1));
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("v.part");

    let (tx, _rx) = mpsc::channel(1024);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let report = run_transfer(&client(), &request(url, &temp, 0, 1000), &tx, stop_rx).await;

    assert!(matches!(
        report.outcome,
        TransferOutcome::Failed(DownloadError::SizeMismatch(_))
    ));
    assert_eq!(report.offset, 0);
}

#[tokio::test]
async fn dropped_connection_keeps_flushed_bytes() {
    let server = MediaServer::start().await;
    let body = payload(1000, 9);
    let url = server.add("v.m4s", body.clone());
    server.fault("v.m4s", Fault::CutAfter(300));
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("v.part");

    let (tx, _rx) = mpsc::channel(1024);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let report = run_transfer(&client(), &request(url, &temp, 0, 1000), &tx, stop_rx).await;

    assert!(matches!(report.outcome, TransferOutcome::Interrupted(_)));
    let on_disk = std::fs::read(&temp).unwrap();
    assert_eq!(report.offset, on_disk.len() as u64);
    assert!(report.offset <= 300);
    assert_eq!(on_disk, &body[..on_disk.len()]);
}

#[tokio::test]
async fn stop_signal_ends_a_stalled_transfer() {
    let server = MediaServer::start().await;
    let body = payload(1000, 5);
    let url = server.add("v.m4s", body.clone());
    server.fault("v.m4s", Fault::StallAfter(128));
    let dir = tempfile::tempdir().unwrap();
    let temp = dir.path().join("v.part");

    let (tx, mut rx) = mpsc::channel(1024);
    let (stop_tx, stop_rx) = watch::channel(false);
    let request = request(url, &temp, 0, 1000);
    let client = client();
    let transfer = tokio::spawn(async move { run_transfer(&client, &request, &tx, stop_rx).await });

    // Wait until the first bytes are on disk
    let mut flushed = 0;
    while flushed < 128 {
        match rx.recv().await {
            Some(vibe_media::download::transfer::TransferEvent::Chunk { bytes, .. }) => {
                flushed += bytes
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    stop_tx.send(true).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), transfer)
        .await
        .expect("transfer did not stop")
        .unwrap();
    assert_eq!(report.outcome, TransferOutcome::Cancelled);
    assert_eq!(report.offset, 128);
    assert_eq!(std::fs::read(&temp).unwrap(), &body[..128]);
}

#[tokio::test]
async fn stream_set_downloads_both_streams() {
    let server = MediaServer::start().await;
    let video = payload(1000, 1);
    let audio = payload(200, 2);
    let video_url = server.add("v.m4s", video.clone());
    let audio_url = server.add("a.m4s", audio.clone());
    let dir = tempfile::tempdir().unwrap();

    let mut audio_request = request(audio_url, &dir.path().join("a.part"), 0, 200);
    audio_request.kind = StreamKind::Audio;
    let set = StreamSet::new(
        "set",
        client(),
        vec![request(video_url, &dir.path().join("v.part"), 0, 1000), audio_request],
    );
    assert_eq!(set.total(), 1200);

    let (_cancel_tx, cancel_rx) = watch::channel(None);
    let mut seen = Vec::new();
    let report = set
        .run(cancel_rx, |downloaded| {
            seen.push(downloaded);
            Ok(())
        })
        .await;

    assert!(matches!(report.outcome, SetOutcome::Complete));
    assert_eq!(report.downloaded, 1200);
    assert_eq!(seen.last(), Some(&1200));
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(std::fs::read(dir.path().join("v.part")).unwrap(), video);
    assert_eq!(std::fs::read(dir.path().join("a.part")).unwrap(), audio);
}

#[tokio::test]
async fn interrupted_stream_pauses_the_set() {
    let server = MediaServer::start().await;
    let video_url = server.add("v.m4s", payload(1000, 1));
    let audio_url = server.add("a.m4s", payload(200, 2));
    server.fault("v.m4s", Fault::CutAfter(256));
    let dir = tempfile::tempdir().unwrap();

    let mut audio_request = request(audio_url, &dir.path().join("a.part"), 0, 200);
    audio_request.kind = StreamKind::Audio;
    let set = StreamSet::new(
        "set",
        client(),
        vec![request(video_url, &dir.path().join("v.part"), 0, 1000), audio_request],
    );

    let (_cancel_tx, cancel_rx) = watch::channel(None);
    let report = set.run(cancel_rx, |_| Ok(())).await;

    match report.outcome {
        SetOutcome::Paused(reason) => assert!(reason.starts_with("video stream interrupted")),
        other => panic!("expected a pause, got {:?}", other),
    }
    let on_disk = std::fs::metadata(dir.path().join("v.part")).unwrap().len()
        + std::fs::metadata(dir.path().join("a.part")).unwrap().len();
    assert_eq!(report.downloaded, on_disk);
}
