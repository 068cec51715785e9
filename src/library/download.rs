//! A completed download directory and its state markers.

use crate::error::{Error, Result};
use crate::library::File;
use crate::transfer::Marker;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// A named directory directly under the library root.
#[derive(Debug, Clone)]
pub struct Download {
    pub id: String,
    pub created: DateTime<Utc>,
    root: PathBuf,
}

impl Download {
    pub(crate) fn new(root: &Path, id: String) -> Download {
        let created = std::fs::metadata(root.join(&id))
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Download {
            id,
            created,
            root: root.to_path_buf(),
        }
    }

    /// Absolute path of the download directory.
    ///
    /// Panics when the id resolves to the root itself or escapes it; such an
    /// id can only come from a tampered request.
    pub fn path(&self) -> PathBuf {
        let path = clean_join(&self.root, &self.id);
        if path == self.root || !path.starts_with(&self.root) {
            panic!("invalid or missing download id {:?}", self.id);
        }
        path
    }

    /// Total size of all files, recursively.
    pub fn size(&self) -> u64 {
        WalkDir::new(self.path())
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    pub fn thumbnail_file(&self) -> PathBuf {
        self.path().join("thumbnail.png")
    }

    pub fn thumbnail(&self) -> bool {
        self.thumbnail_file().exists()
    }

    pub fn downloading(&self) -> bool {
        crate::transfer::marked(&self.path(), Marker::Downloading)
    }

    pub fn uploading(&self) -> bool {
        crate::transfer::marked(&self.path(), Marker::Uploading)
    }

    pub fn share_file(&self) -> PathBuf {
        self.root.join(".shared").join(&self.id)
    }

    pub fn shared(&self) -> bool {
        self.share_file().exists()
    }

    /// Mark the download as shared with friends. Idempotent.
    pub fn share(&self) -> Result<()> {
        if self.shared() {
            return Ok(());
        }
        let dir = self.root.join(".shared");
        std::fs::create_dir_all(&dir)?;
        std::fs::File::create(self.share_file())?;
        Ok(())
    }

    /// Remove the share marker. Idempotent.
    pub fn unshare(&self) -> Result<()> {
        if !self.shared() {
            return Ok(());
        }
        std::fs::remove_file(self.share_file())?;
        Ok(())
    }

    /// All files inside the download. Dot-prefixed names are always hidden;
    /// thumbnails only appear when `thumbnails` is set.
    pub fn files(&self, thumbnails: bool) -> Vec<File> {
        let base = self.path();
        let mut files = Vec::new();
        for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if !thumbnails && name.ends_with("thumbnail.png") {
                continue;
            }
            let Ok(id) = entry.path().strip_prefix(&base) else {
                continue;
            };
            let Some(file) = File::new(id.to_string_lossy().into_owned(), entry.path()) else {
                continue;
            };
            files.push(file);
        }
        files.sort_by(|a, b| b.id.cmp(&a.id));
        files
    }

    /// Find a file by its id (path relative to the download directory).
    /// Thumbnails are only reachable when the id asks for one.
    pub fn find_file(&self, id: &str) -> Result<File> {
        let thumbnails = id.contains("thumbnail");
        self.files(thumbnails)
            .into_iter()
            .find(|file| file.id == id)
            .ok_or(Error::NotFound)
    }
}

/// Lexically join an untrusted id onto the root, never ascending above it
/// through `..` components.
fn clean_join(root: &Path, id: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in Path::new(id).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::ParentDir => {
                path.pop();
            }
            _ => {}
        }
    }
    path
}
