//! Narrow driver interface over the embedded torrent client.
//!
//! The engine needs a handful of capabilities from whatever torrent
//! implementation backs it: admit a magnet or metainfo target, wait for the
//! metadata, start writing under a chosen directory, report byte counts and
//! drop the torrent. Everything else the client does (peers, trackers, rate
//! limiting) stays behind this seam.

mod rqbit;

#[cfg(test)]
pub mod mock;

pub use rqbit::{RqbitClient, RqbitOptions};

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Metadata for an admitted torrent.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub name: String,
    /// True when the torrent is one bare file with no wrapping directory.
    pub single_file: bool,
    pub files: Vec<TorrentFileInfo>,
}

#[derive(Debug, Clone)]
pub struct TorrentFileInfo {
    /// Path relative to the client's output directory.
    pub path: PathBuf,
    pub length: u64,
}

impl TorrentInfo {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }
}

#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Admit a magnet link. Metadata may not be known yet.
    async fn add_magnet(&self, url: &str) -> Result<Arc<dyn TorrentHandle>>;

    /// Admit raw `.torrent` metainfo bytes.
    async fn add_metainfo(&self, bytes: Vec<u8>) -> Result<Arc<dyn TorrentHandle>>;
}

#[async_trait]
pub trait TorrentHandle: Send + Sync {
    /// Wait until the torrent's metadata is known.
    async fn wait_info(&self) -> Result<TorrentInfo>;

    /// Begin downloading every file, writing under `output_dir`.
    async fn download_all(&self, output_dir: &Path) -> Result<()>;

    /// Bytes still missing from a complete copy.
    fn bytes_missing(&self) -> u64;

    /// Payload bytes uploaded to peers so far.
    fn bytes_uploaded(&self) -> u64;

    fn total_length(&self) -> u64;

    /// Remove the torrent from the client. Never touches downloaded files.
    async fn drop_torrent(&self) -> Result<()>;
}
