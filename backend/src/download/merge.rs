//! Merge stage: turns finished partial files into the deliverable

use crate::config::{MergeSettings, MergeStrategyKind};
use crate::db::StreamKind;
use crate::download::unique_file_path;
use crate::error::DownloadError;
use futures_util::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Combines a video and an audio file into one output file
pub trait MergeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge<'a>(
        &'a self,
        video: &'a Path,
        audio: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), DownloadError>>;
}

/// Build the strategy selected in the settings
pub fn merger_for(settings: &MergeSettings) -> Arc<dyn MergeStrategy> {
    match settings.strategy {
        MergeStrategyKind::Ffmpeg => Arc::new(FfmpegMerger::new(settings.ffmpeg_path.clone())),
        MergeStrategyKind::Concat => Arc::new(ConcatMerger),
    }
}

/// Remuxes both streams with `ffmpeg`, copying codecs
pub struct FfmpegMerger {
    program: PathBuf,
}

impl FfmpegMerger {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), DownloadError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(["-y", "-loglevel", "error", "-i"])
            .arg(video)
            .arg("-i")
            .arg(audio)
            .args(["-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let result = command.output().await.map_err(|e| {
            DownloadError::Merge(format!("failed to run {}: {}", self.program.display(), e))
        })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(DownloadError::Merge(format!(
                "ffmpeg exited with {}: {}",
                result.status, detail
            )));
        }

        Ok(())
    }
}

impl MergeStrategy for FfmpegMerger {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn merge<'a>(
        &'a self,
        video: &'a Path,
        audio: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), DownloadError>> {
        Box::pin(self.run(video, audio, output))
    }
}

/// Writes the video bytes followed by the audio bytes
pub struct ConcatMerger;

impl MergeStrategy for ConcatMerger {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn merge<'a>(
        &'a self,
        video: &'a Path,
        audio: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), DownloadError>> {
        Box::pin(async move {
            let mut out = File::create(output).await?;
            for input in [video, audio] {
                let mut part = File::open(input).await?;
                tokio::io::copy(&mut part, &mut out).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok(())
        })
    }
}

/// A fully downloaded stream waiting to be finalized
#[derive(Debug, Clone)]
pub struct StreamPart {
    pub kind: StreamKind,
    pub path: PathBuf,
    pub expected_size: u64,
}

/// Produce the deliverable at (a unique variant of) `target`.
///
/// Refuses to run unless every part has exactly its expected size on disk.
/// A single part is moved into place; two parts go through `strategy`.
/// Partial files are removed only after success.
pub async fn finalize(
    strategy: &dyn MergeStrategy,
    parts: &[StreamPart],
    target: &Path,
) -> Result<PathBuf, DownloadError> {
    for part in parts {
        let actual = match tokio::fs::metadata(&part.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::SizeMismatch(format!(
                    "{} stream file {} is missing",
                    part.kind,
                    part.path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if actual != part.expected_size {
            return Err(DownloadError::SizeMismatch(format!(
                "{} stream file has {} bytes, expected {}",
                part.kind, actual, part.expected_size
            )));
        }
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let output = unique_file_path(target);

    match parts {
        [single] => {
            tokio::fs::rename(&single.path, &output).await?;
            info!("Moved {} to {}", single.path.display(), output.display());
        }
        [video, audio] => {
            info!(
                "Merging {} + {} into {} ({})",
                video.path.display(),
                audio.path.display(),
                output.display(),
                strategy.name()
            );
            if let Err(err) = strategy.merge(&video.path, &audio.path, &output).await {
                if let Err(e) = tokio::fs::remove_file(&output).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove incomplete {}: {}", output.display(), e);
                    }
                }
                return Err(err);
            }
            for part in parts {
                if let Err(e) = tokio::fs::remove_file(&part.path).await {
                    warn!("Failed to delete {}: {}", part.path.display(), e);
                }
            }
        }
        _ => {
            return Err(DownloadError::Merge(format!(
                "expected one or two streams, got {}",
                parts.len()
            )))
        }
    }

    Ok(output)
}
