//! The on-disk library: completed downloads and the files inside them.
//!
//! The library is derived entirely from the download root. Sentinel files
//! (`<dir>.downloading`) hide in-flight work, dot-prefixed entries and
//! thumbnails are never listed.

mod download;
mod file;

pub use download::Download;
pub use file::File;
pub(crate) use file::ext_of;

use crate::error::{Error, Result};
use std::path::Path;

/// List completed downloads under the root, name-descending.
pub fn list_downloads(root: &Path) -> Result<Vec<Download>> {
    let mut downloads = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name.ends_with("thumbnail.png") {
            continue;
        }
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let download = Download::new(root, name);
        // Skip downloads that are currently transferring.
        if download.downloading() {
            continue;
        }
        downloads.push(download);
    }
    downloads.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(downloads)
}

pub fn find_download(root: &Path, id: &str) -> Result<Download> {
    list_downloads(root)?
        .into_iter()
        .find(|download| download.id == id)
        .ok_or(Error::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn listing_filters_and_orders() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir(root.join("Alpha")).unwrap();
        std::fs::create_dir(root.join("Beta")).unwrap();
        std::fs::create_dir(root.join(".shared")).unwrap();
        std::fs::create_dir(root.join("InFlight")).unwrap();
        std::fs::write(root.join("InFlight.downloading"), "downloading\n").unwrap();
        std::fs::write(root.join("stray.txt"), "x").unwrap();

        let ids: Vec<_> = list_downloads(root)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["Beta".to_string(), "Alpha".to_string()]);
    }

    #[test]
    fn find_misses_hidden_entries() {
        let tmp = tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("Movie")).unwrap();

        assert!(find_download(tmp.path(), "Movie").is_ok());
        assert!(matches!(
            find_download(tmp.path(), ".shared"),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            find_download(tmp.path(), "nope"),
            Err(Error::NotFound)
        ));
    }
}
