//! Runtime settings persisted to `config.json` in the download root.

use crate::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_ratio() -> f64 {
    1.5
}

fn default_transfer_slots() -> usize {
    5
}

fn default_transcode_min_divisor() -> u64 {
    5
}

/// Operator-tunable settings. Unknown fields in an existing file are ignored,
/// missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Target seed ratio for torrent transfers. Zero disables seeding.
    #[serde(default = "default_ratio")]
    pub ratio: f64,

    #[serde(default)]
    pub accept_tos: bool,

    /// Concurrent non-seeding transfer slots.
    #[serde(default = "default_transfer_slots")]
    pub transfer_slots: usize,

    /// A transcoded file must be at least `source size / this` bytes.
    #[serde(default = "default_transcode_min_divisor")]
    pub transcode_min_divisor: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            ratio: default_ratio(),
            accept_tos: false,
            transfer_slots: default_transfer_slots(),
            transcode_min_divisor: default_transcode_min_divisor(),
        }
    }
}

/// Shared handle to the settings. Reads snapshot under the lock; writes
/// persist to disk before returning.
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

struct ConfigInner {
    path: PathBuf,
    state: RwLock<Settings>,
}

impl Config {
    /// Load `config.json` from the download root, creating it with defaults
    /// when missing.
    pub fn load(root: &Path) -> Result<Config> {
        let path = root.join("config.json");
        let settings = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| crate::error::Error::Transport(Box::new(err)))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(err) => return Err(err.into()),
        };

        let config = Config {
            inner: Arc::new(ConfigInner {
                path,
                state: RwLock::new(settings),
            }),
        };
        config.save()?;
        Ok(config)
    }

    pub fn get(&self) -> Settings {
        self.inner.state.read().clone()
    }

    pub fn set_ratio(&self, ratio: f64) -> Result<()> {
        self.inner.state.write().ratio = ratio;
        self.save()
    }

    pub fn set_accept_tos(&self, accept: bool) -> Result<()> {
        self.inner.state.write().accept_tos = accept;
        self.save()
    }

    pub fn set_transfer_slots(&self, slots: usize) -> Result<()> {
        self.inner.state.write().transfer_slots = slots;
        self.save()
    }

    fn save(&self) -> Result<()> {
        let bytes = {
            let state = self.inner.state.read();
            serde_json::to_vec_pretty(&*state)
                .map_err(|err| crate::error::Error::Transport(Box::new(err)))?
        };

        // Write-then-rename so a crash never leaves a torn config behind.
        let dir = self.inner.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&self.inner.path).map_err(|err| err.error)?;
        Ok(())
    }
}
