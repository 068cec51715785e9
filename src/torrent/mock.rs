//! Scripted in-memory torrent driver for engine tests.

use super::{TorrentClient, TorrentFileInfo, TorrentHandle, TorrentInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
struct Script {
    info: TorrentInfo,
    /// Write the files and report complete as soon as `download_all` runs.
    complete_on_download: bool,
}

#[derive(Default)]
pub struct MockClient {
    scripts: Mutex<HashMap<String, Script>>,
    handles: Mutex<Vec<Arc<MockHandle>>>,
}

impl MockClient {
    pub fn new() -> Arc<MockClient> {
        Arc::new(MockClient::default())
    }

    /// Script the torrent behind a target URL.
    pub fn script(&self, url: &str, info: TorrentInfo, complete_on_download: bool) {
        self.scripts.lock().insert(
            url.to_string(),
            Script {
                info,
                complete_on_download,
            },
        );
    }

    /// The n-th handle this client handed out.
    pub fn handle(&self, index: usize) -> Arc<MockHandle> {
        self.handles.lock()[index].clone()
    }
}

#[async_trait]
impl TorrentClient for MockClient {
    async fn add_magnet(&self, url: &str) -> Result<Arc<dyn TorrentHandle>> {
        let script = self
            .scripts
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::transport(format!("no scripted torrent for {url}")))?;
        let handle = Arc::new(MockHandle::new(script));
        self.handles.lock().push(handle.clone());
        Ok(handle)
    }

    async fn add_metainfo(&self, bytes: Vec<u8>) -> Result<Arc<dyn TorrentHandle>> {
        // Metainfo bytes double as the script key.
        let key = String::from_utf8_lossy(&bytes).into_owned();
        self.add_magnet(&key).await
    }
}

pub struct MockHandle {
    script: Script,
    missing: AtomicU64,
    uploaded: AtomicU64,
    dropped: AtomicBool,
}

impl MockHandle {
    fn new(script: Script) -> MockHandle {
        let total = script.info.total_length();
        MockHandle {
            script,
            missing: AtomicU64::new(total),
            uploaded: AtomicU64::new(0),
            dropped: AtomicBool::new(false),
        }
    }

    pub fn set_uploaded(&self, bytes: u64) {
        self.uploaded.store(bytes, Ordering::SeqCst);
    }

    pub fn dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TorrentHandle for MockHandle {
    async fn wait_info(&self) -> Result<TorrentInfo> {
        Ok(self.script.info.clone())
    }

    async fn download_all(&self, output_dir: &Path) -> Result<()> {
        if !self.script.complete_on_download {
            return Ok(());
        }
        for file in &self.script.info.files {
            let path = output_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, vec![0u8; file.length as usize])?;
        }
        self.missing.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn bytes_missing(&self) -> u64 {
        self.missing.load(Ordering::SeqCst)
    }

    fn bytes_uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::SeqCst)
    }

    fn total_length(&self) -> u64 {
        self.script.info.total_length()
    }

    async fn drop_torrent(&self) -> Result<()> {
        self.dropped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A torrent holding one bare file.
pub fn single_file(name: &str, length: u64) -> TorrentInfo {
    TorrentInfo {
        name: name.to_string(),
        single_file: true,
        files: vec![TorrentFileInfo {
            path: PathBuf::from(name),
            length,
        }],
    }
}

/// A torrent whose files live under a directory named after it.
pub fn multi_file(name: &str, files: &[(&str, u64)]) -> TorrentInfo {
    TorrentInfo {
        name: name.to_string(),
        single_file: false,
        files: files
            .iter()
            .map(|(path, length)| TorrentFileInfo {
                path: PathBuf::from(name).join(path),
                length: *length,
            })
            .collect(),
    }
}
