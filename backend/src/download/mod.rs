//! Download pipeline: transfer engine, stream coordination, merging and the
//! session manager that drives it all

mod coordinator;
mod manager;
pub mod merge;
pub mod probe;
mod session;
pub mod transfer;

pub use coordinator::{PauseReason, SetOutcome, SetReport, StreamSet};
pub use manager::{
    build_client, DownloadEvent, DownloadManager, DownloadStats, ManagerOptions, NewDownload,
    RecoveryReport,
};
pub use merge::{ConcatMerger, FfmpegMerger, MergeStrategy};

use std::path::{Path, PathBuf};

/// Derive a file name (without extension) from the last URL path segment
pub fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        if let Some(last) = parsed.path_segments().and_then(|mut s| s.next_back()) {
            let decoded = urlencoding::decode(last)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| last.to_string());
            if let Some(stem) = Path::new(&decoded).file_stem() {
                let stem = stem.to_string_lossy();
                if !stem.is_empty() {
                    return stem.into_owned();
                }
            }
        }
    }

    // Last resort: generate a name
    format!("download_{}", chrono::Utc::now().timestamp())
}

/// Make a user supplied title usable as a file name on every platform
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let cleaned = cleaned.trim().trim_end_matches('.').trim_end();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `path` if it is free, otherwise the first free `name(n).ext`
pub fn unique_file_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let candidate = path.with_file_name(format!("{stem}({counter}){extension}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_url_path() {
        assert_eq!(
            extract_filename("https://cdn.example.com/upgcxcode/30080.m4s?deadline=1"),
            "30080"
        );
        assert_eq!(
            extract_filename("https://cdn.example.com/media/my%20clip.mp4"),
            "my clip"
        );
        assert!(extract_filename("not a url").starts_with("download_"));
    }

    #[test]
    fn sanitizes_reserved_characters() {
        assert_eq!(sanitize_file_name("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_file_name("  title.  "), "title");
        assert_eq!(sanitize_file_name("..."), "download");
        assert_eq!(sanitize_file_name("第1话 开始"), "第1话 开始");
    }

    #[test]
    fn unique_path_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("clip.mp4");
        assert_eq!(unique_file_path(&target), target);

        std::fs::write(&target, b"x").unwrap();
        assert_eq!(unique_file_path(&target), dir.path().join("clip(1).mp4"));

        std::fs::write(dir.path().join("clip(1).mp4"), b"x").unwrap();
        assert_eq!(unique_file_path(&target), dir.path().join("clip(2).mp4"));
    }
}
