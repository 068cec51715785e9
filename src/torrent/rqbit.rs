//! librqbit-backed implementation of the torrent driver.
//!
//! Targets are first resolved in list-only mode, which fetches magnet
//! metadata from the swarm without opening any storage. The torrent only
//! goes live (and starts writing) in `download_all`, once the transfer
//! worker has picked the download directory and marked it.

use super::{TorrentClient, TorrentFileInfo, TorrentHandle, TorrentInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use librqbit::limits::LimitsConfig;
use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session, SessionOptions,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct RqbitOptions {
    pub listen_port: u16,
    /// Upload ceiling in bytes per second.
    pub upload_bps: u64,
    /// Download ceiling in bytes per second.
    pub download_bps: u64,
}

/// One process-wide torrent session rooted at the download directory.
pub struct RqbitClient {
    session: Arc<Session>,
}

impl RqbitClient {
    pub async fn new(root: &Path, opts: RqbitOptions) -> Result<RqbitClient> {
        let mut session_opts = SessionOptions::default();
        session_opts.persistence = None;
        session_opts.disable_dht_persistence = true;
        session_opts.listen_port_range = Some(opts.listen_port..opts.listen_port + 1);
        session_opts.ratelimits = LimitsConfig {
            upload_bps: NonZeroU32::new(opts.upload_bps.min(u32::MAX as u64) as u32),
            download_bps: NonZeroU32::new(opts.download_bps.min(u32::MAX as u64) as u32),
        };

        let session = Session::new_with_opts(root.to_path_buf(), session_opts)
            .await
            .map_err(Error::from)?;
        Ok(RqbitClient { session })
    }

    async fn resolve(&self, target: AddTorrent<'_>) -> Result<RqbitHandle> {
        let response = self
            .session
            .add_torrent(
                target,
                Some(AddTorrentOptions {
                    list_only: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(Error::from)?;

        match response {
            AddTorrentResponse::ListOnly(listed) => {
                let bytes = listed.torrent_bytes.to_vec();
                let info = parse_metainfo(&bytes)?;
                Ok(RqbitHandle {
                    session: self.session.clone(),
                    torrent_bytes: bytes,
                    info,
                    live: Mutex::new(None),
                })
            }
            _ => Err(Error::transport("torrent client did not return metadata")),
        }
    }
}

#[async_trait]
impl TorrentClient for RqbitClient {
    async fn add_magnet(&self, url: &str) -> Result<Arc<dyn TorrentHandle>> {
        let handle = self.resolve(AddTorrent::from_url(url)).await?;
        Ok(Arc::new(handle))
    }

    async fn add_metainfo(&self, bytes: Vec<u8>) -> Result<Arc<dyn TorrentHandle>> {
        let handle = self.resolve(AddTorrent::from_bytes(bytes)).await?;
        Ok(Arc::new(handle))
    }
}

struct RqbitHandle {
    session: Arc<Session>,
    torrent_bytes: Vec<u8>,
    info: TorrentInfo,
    live: Mutex<Option<Arc<ManagedTorrent>>>,
}

#[async_trait]
impl TorrentHandle for RqbitHandle {
    async fn wait_info(&self) -> Result<TorrentInfo> {
        // Metadata was already resolved during admission.
        Ok(self.info.clone())
    }

    async fn download_all(&self, output_dir: &Path) -> Result<()> {
        let response = self
            .session
            .add_torrent(
                AddTorrent::from_bytes(self.torrent_bytes.clone()),
                Some(AddTorrentOptions {
                    overwrite: true,
                    output_folder: Some(output_dir.to_string_lossy().into_owned()),
                    ..Default::default()
                }),
            )
            .await
            .map_err(Error::from)?;

        let handle = match response {
            AddTorrentResponse::Added(_, handle) => handle,
            AddTorrentResponse::AlreadyManaged(_, handle) => handle,
            AddTorrentResponse::ListOnly(_) => {
                return Err(Error::transport("torrent client refused to go live"))
            }
        };
        *self.live.lock() = Some(handle);
        Ok(())
    }

    fn bytes_missing(&self) -> u64 {
        match self.live.lock().as_ref() {
            Some(handle) => {
                let stats = handle.stats();
                stats.total_bytes.saturating_sub(stats.progress_bytes)
            }
            None => self.info.total_length(),
        }
    }

    fn bytes_uploaded(&self) -> u64 {
        match self.live.lock().as_ref() {
            Some(handle) => handle.stats().uploaded_bytes,
            None => 0,
        }
    }

    fn total_length(&self) -> u64 {
        self.info.total_length()
    }

    async fn drop_torrent(&self) -> Result<()> {
        let live = self.live.lock().take();
        if let Some(handle) = live {
            self.session
                .delete(handle.id().into(), false)
                .await
                .map_err(Error::from)?;
        }
        Ok(())
    }
}

// Bencoded metainfo, deserialized just far enough to know the layout.
#[derive(Deserialize)]
struct MetaInfo {
    info: MetaInfoDict,
}

#[derive(Deserialize)]
struct MetaInfoDict {
    name: String,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    files: Option<Vec<MetaInfoFile>>,
}

#[derive(Deserialize)]
struct MetaInfoFile {
    length: u64,
    path: Vec<String>,
}

fn parse_metainfo(bytes: &[u8]) -> Result<TorrentInfo> {
    let meta: MetaInfo = serde_bencode::from_bytes(bytes)
        .map_err(|err| Error::transport(format!("invalid torrent metainfo: {err}")))?;

    let name = meta.info.name;
    match meta.info.files {
        // Multi-file torrents nest everything under a directory named after
        // the torrent; the client lays files out the same way.
        Some(files) => Ok(TorrentInfo {
            files: files
                .into_iter()
                .map(|file| TorrentFileInfo {
                    path: std::iter::once(name.as_str())
                        .chain(file.path.iter().map(String::as_str))
                        .collect::<PathBuf>(),
                    length: file.length,
                })
                .collect(),
            single_file: false,
            name,
        }),
        None => {
            let length = meta
                .info
                .length
                .ok_or_else(|| Error::transport("torrent metainfo has no length"))?;
            Ok(TorrentInfo {
                files: vec![TorrentFileInfo {
                    path: PathBuf::from(&name),
                    length,
                }],
                single_file: true,
                name,
            })
        }
    }
}
