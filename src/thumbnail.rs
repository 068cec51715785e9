//! Video thumbnails extracted with the encoder's thumbnail filter.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions worth thumbnailing.
const VIDEO_EXTS: &[&str] = &["mp4", "m4v", "avi", "flv", "mov", "mkv", "webm"];

/// Generate a thumbnail for every video in a finished download and promote
/// the biggest video's thumbnail to the download cover. Failures are logged
/// and skipped; a download without thumbnails is still a download.
pub async fn post_process(dir: &Path) {
    let mut best: Option<PathBuf> = None;
    let mut biggest: u64 = 0;

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = crate::library::ext_of(entry.path());
        if !VIDEO_EXTS.contains(&ext.as_str()) {
            continue;
        }

        let video = entry.path();
        let thumb = thumbnail_name(video);
        if let Err(err) = generate(video, &thumb).await {
            warn!(video = %video.display(), error = %err, "thumbnail failed");
            continue;
        }
        debug!(video = %video.display(), "thumbnail generated");

        let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        if size >= biggest {
            biggest = size;
            best = Some(thumb);
        }
    }

    if let Some(best) = best {
        if let Err(err) = std::fs::copy(&best, dir.join("thumbnail.png")) {
            warn!(error = %err, "copying download cover failed");
        }
    }
}

/// Extract up to five candidate frames at 480x270, one every six seconds,
/// and keep the largest.
pub async fn generate(video: &Path, thumb: &Path) -> Result<()> {
    let parent = thumb.parent().unwrap_or(Path::new("."));
    let scratch = tempfile::Builder::new()
        .prefix(".tmpthumb")
        .tempdir_in(parent)?;

    let output = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(video)
        .args(["-vf", "thumbnail,scale=480:270,fps=1/6", "-vframes", "5"])
        .arg(scratch.path().join("thumbnail%d.png"))
        .output()
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::EncoderMissing,
            _ => Error::from(err),
        })?;

    if !output.status.success() {
        return Err(Error::EncoderFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let mut best: Option<PathBuf> = None;
    let mut biggest: u64 = 0;
    for entry in std::fs::read_dir(scratch.path())? {
        let entry = entry?;
        let size = entry.metadata()?.len();
        if size >= biggest {
            biggest = size;
            best = Some(entry.path());
        }
    }

    match best {
        Some(best) => {
            std::fs::rename(best, thumb)?;
            Ok(())
        }
        None => Err(Error::EncoderFailed("no frames produced".to_string())),
    }
}

/// `<video>.thumbnail.png` beside the video.
pub fn thumbnail_name(video: &Path) -> PathBuf {
    let mut name = video.as_os_str().to_os_string();
    name.push(".thumbnail.png");
    PathBuf::from(name)
}
