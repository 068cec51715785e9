//! Sentinel files bracketing in-flight downloads.
//!
//! A `<dir>.downloading` or `<dir>.uploading` file exists for exactly as long
//! as the corresponding phase. The markers are authoritative across restarts;
//! in-memory transfer state is only a cache.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Downloading,
    Uploading,
}

impl Marker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marker::Downloading => "downloading",
            Marker::Uploading => "uploading",
        }
    }
}

/// The marker path for a download directory: `<dir>.<kind>`.
pub fn marker_file(dir: &Path, kind: Marker) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(".");
    name.push(kind.as_str());
    PathBuf::from(name)
}

pub fn mark(dir: &Path, kind: Marker) -> io::Result<()> {
    std::fs::write(marker_file(dir, kind), format!("{}\n", kind.as_str()))
}

/// Remove the marker. Missing markers are fine.
pub fn unmark(dir: &Path, kind: Marker) -> io::Result<()> {
    match std::fs::remove_file(marker_file(dir, kind)) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub fn marked(dir: &Path, kind: Marker) -> bool {
    marker_file(dir, kind).exists()
}

/// Delete every stale marker directly under the root. The in-flight state a
/// marker described did not survive the restart, so the marker must not
/// either.
pub fn reconcile(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".downloading") || name.ends_with(".uploading") {
            std::fs::remove_file(entry.path())?;
            removed.push(entry.path());
        }
    }
    Ok(removed)
}
