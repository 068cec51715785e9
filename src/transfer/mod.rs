//! Transfer engine: the registry of acquisition targets and the scheduler
//! that drives them.
//!
//! Targets arrive as magnet links, torrent metadata URLs or friend file-list
//! URLs. The registry keys them by a digest of the canonical URL so
//! re-submitting a target is idempotent. A single scheduler task admits up to
//! the configured number of concurrent transfers (seeding transfers exempt)
//! and spawns one worker per admission.

mod friend;
mod sentinel;
mod worker;

pub use sentinel::{marked, Marker};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::torrent::{TorrentClient, TorrentHandle};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use walkdir::WalkDir;

/// Free bytes under the download root, probed on demand.
pub type SpaceProbe = Arc<dyn Fn() -> Result<u64> + Send + Sync>;

/// One acquisition target and its lifecycle state.
///
/// Listings hand out value snapshots; only the owning worker mutates the
/// record in the registry, and every mutation happens under the registry
/// lock.
#[derive(Clone)]
pub struct Transfer {
    pub id: String,
    pub url: Url,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub download_dir: Option<PathBuf>,
    /// Friend transfers: the download id from the file-list URL.
    pub download_id: Option<String>,
    /// Friend transfers: total size reported by the peer.
    pub download_size: u64,
    /// Torrent name, once metadata is known.
    pub name: Option<String>,
    /// True while a finished torrent stays in its seed phase.
    pub uploading: bool,
    /// Seed ratio snapshot taken at admission.
    pub seed_ratio: f64,
    pub error: Option<String>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) torrent: Option<Arc<dyn TorrentHandle>>,
}

impl Transfer {
    fn new(url: Url, seed_ratio: f64) -> Transfer {
        Transfer {
            id: transfer_id(&url),
            url,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            download_dir: None,
            download_id: None,
            download_size: 0,
            name: None,
            uploading: false,
            seed_ratio,
            error: None,
            cancel: None,
            torrent: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.is_started() && !self.is_completed()
    }

    /// Title for listings: the friend download id, the torrent name, the
    /// magnet display name, or a placeholder while metadata loads.
    pub fn title(&self) -> String {
        if let Some(id) = &self.download_id {
            return id.clone();
        }
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some((_, dn)) = self.url.query_pairs().find(|(key, _)| key == "dn") {
            if !dn.is_empty() {
                return dn.into_owned();
            }
        }
        format!("Loading {} link...", self.url.scheme())
    }

    pub fn total_size(&self) -> u64 {
        if self.download_size > 0 {
            return self.download_size;
        }
        self.torrent
            .as_ref()
            .map(|handle| handle.total_length())
            .unwrap_or(0)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        if let Some(handle) = &self.torrent {
            return handle.total_length().saturating_sub(handle.bytes_missing());
        }
        match &self.download_dir {
            Some(dir) => du(dir),
            None => 0,
        }
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.torrent
            .as_ref()
            .map(|handle| handle.bytes_uploaded())
            .unwrap_or(0)
    }

    /// Bytes that must be uploaded before the seed phase ends.
    pub fn seed_target_bytes(&self) -> u64 {
        if self.torrent.is_none() || self.seed_ratio <= 0.0 {
            return 0;
        }
        (self.total_size() as f64 * self.seed_ratio) as u64
    }
}

fn transfer_id(url: &Url) -> String {
    hex::encode(Md5::digest(url.as_str().as_bytes()))
}

fn du(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// The transfer engine. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    root: PathBuf,
    http_prefix: String,
    config: Config,
    torrent: Arc<dyn TorrentClient>,
    space: SpaceProbe,
    http: reqwest::Client,
    transfers: RwLock<Vec<Transfer>>,
    wake: Notify,
}

impl Engine {
    /// Build an engine rooted at `root`. Stale sentinel files are swept
    /// before any work can be admitted.
    pub fn new(
        root: PathBuf,
        http_prefix: String,
        config: Config,
        torrent: Arc<dyn TorrentClient>,
        space: SpaceProbe,
    ) -> Result<Engine> {
        std::fs::create_dir_all(&root)?;
        for stale in sentinel::reconcile(&root)? {
            debug!(marker = %stale.display(), "removed stale transfer marker");
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("watcher/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Engine {
            inner: Arc::new(EngineInner {
                root,
                http_prefix,
                config,
                torrent,
                space,
                http,
                transfers: RwLock::new(Vec::new()),
                wake: Notify::new(),
            }),
        })
    }

    /// Spawn the scheduler task. Call once.
    pub fn start(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = engine.inner.wake.notified() => {}
                }
                engine.tick();
            }
        });
    }

    /// One scheduler pass: purge completed transfers and admit pending ones
    /// while slots remain. Seeding transfers hold no slot, so long seed
    /// phases never starve downloads.
    pub(crate) fn tick(&self) {
        let slots = self.inner.config.get().transfer_slots;
        let mut started = Vec::new();
        {
            let mut transfers = self.inner.transfers.write();
            let mut active = transfers
                .iter()
                .filter(|t| t.is_active() && !t.uploading)
                .count();
            transfers.retain_mut(|t| {
                if t.is_active() {
                    return true;
                }
                if t.is_completed() {
                    debug!(id = %t.id, "purging completed transfer");
                    return false;
                }
                if active < slots {
                    active += 1;
                    t.started_at = Some(Utc::now());
                    started.push(t.id.clone());
                }
                true
            });
        }
        for id in started {
            debug!(%id, "starting transfer");
            let engine = self.clone();
            tokio::spawn(async move {
                worker::run(engine, id).await;
            });
        }
    }

    /// Register a target. Re-adding an existing URL returns the existing
    /// record unchanged.
    pub fn add(&self, raw_url: &str) -> Result<Transfer> {
        let url = Url::parse(raw_url.trim())
            .map_err(|_| Error::InvalidTarget(raw_url.to_string()))?;

        let transfer = {
            let mut transfers = self.inner.transfers.write();
            if let Some(existing) = transfers.iter().find(|t| t.url == url) {
                return Ok(existing.clone());
            }
            let transfer = Transfer::new(url, self.inner.config.get().ratio);
            transfers.push(transfer.clone());
            transfer
        };

        self.inner.wake.notify_one();
        Ok(transfer)
    }

    /// Cancel and forget a transfer. The partial download directory is
    /// deleted unless the transfer already finished downloading and is only
    /// seeding.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let transfer = {
            let mut transfers = self.inner.transfers.write();
            let index = transfers
                .iter()
                .position(|t| t.id == id)
                .ok_or(Error::NotFound)?;
            transfers.remove(index)
        };

        if let Some(cancel) = &transfer.cancel {
            cancel.cancel();
        }
        if let Some(handle) = &transfer.torrent {
            if let Err(err) = handle.drop_torrent().await {
                warn!(%id, error = %err, "dropping torrent failed");
            }
        }
        if let Some(dir) = &transfer.download_dir {
            if !transfer.uploading && dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
            sentinel::unmark(dir, Marker::Downloading)?;
            sentinel::unmark(dir, Marker::Uploading)?;
        }

        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<Transfer> {
        self.inner
            .transfers
            .read()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    pub fn find_by_url(&self, raw_url: &str) -> Result<Transfer> {
        let url =
            Url::parse(raw_url.trim()).map_err(|_| Error::InvalidTarget(raw_url.to_string()))?;
        self.inner
            .transfers
            .read()
            .iter()
            .find(|t| t.url == url)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Snapshot of running transfers, insertion order.
    pub fn list_active(&self) -> Vec<Transfer> {
        self.inner
            .transfers
            .read()
            .iter()
            .filter(|t| t.is_active())
            .cloned()
            .collect()
    }

    /// Snapshot of transfers waiting for a slot, insertion order.
    pub fn list_pending(&self) -> Vec<Transfer> {
        self.inner
            .transfers
            .read()
            .iter()
            .filter(|t| !t.is_started() && !t.is_completed())
            .cloned()
            .collect()
    }

    pub fn busy(&self) -> bool {
        !self.inner.transfers.read().is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub(crate) fn http_prefix(&self) -> &str {
        &self.inner.http_prefix
    }

    pub(crate) fn torrent(&self) -> &Arc<dyn TorrentClient> {
        &self.inner.torrent
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub(crate) fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Run `f` against the live record, under the registry lock. Returns
    /// `None` when the transfer has been removed in the meantime.
    pub(crate) fn with_transfer<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Transfer) -> R,
    ) -> Option<R> {
        let mut transfers = self.inner.transfers.write();
        transfers.iter_mut().find(|t| t.id == id).map(f)
    }

    /// Whether `required` bytes fit under the root, keeping a 5% reserve.
    pub(crate) fn available_storage(&self, required: u64) -> Result<bool> {
        let free = (self.inner.space)()?;
        let free = free - free / 20;
        if required >= free {
            debug!(required, free, "insufficient storage for transfer");
            return Ok(false);
        }
        Ok(true)
    }
}
