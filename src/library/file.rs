//! Files inside a download, classified by extension.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Extensions that stream directly in a browser or podcast client.
const VIEWABLE: &[&str] = &["mp4", "m4v", "m4a", "m4b", "mp3"];

/// Extensions the transcoder can turn into a viewable mp4.
const CONVERTIBLE: &[&str] = &["avi", "flv", "mov", "mkv", "webm", "wma"];

/// Extensions worth opening inline.
const CLICKABLE: &[&str] = &["jpg", "jpeg", "gif", "png", "txt", "pdf"];

#[derive(Debug, Clone)]
pub struct File {
    /// Path relative to the enclosing download directory.
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl File {
    pub(crate) fn new(id: String, path: &Path) -> Option<File> {
        let meta = std::fs::metadata(path).ok()?;
        Some(File {
            id,
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified().map(DateTime::<Utc>::from).ok()?,
        })
    }

    pub fn base(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Lowercased extension without the dot.
    pub fn ext(&self) -> String {
        ext_of(&self.path)
    }

    pub fn viewable(&self) -> bool {
        VIEWABLE.contains(&self.ext().as_str())
    }

    pub fn convertible(&self) -> bool {
        CONVERTIBLE.contains(&self.ext().as_str())
    }

    pub fn clickable(&self) -> bool {
        CLICKABLE.contains(&self.ext().as_str())
    }

    pub fn thumbnail_file(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".thumbnail.png");
        PathBuf::from(name)
    }

    pub fn thumbnail(&self) -> bool {
        self.thumbnail_file().exists()
    }
}

pub(crate) fn ext_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
