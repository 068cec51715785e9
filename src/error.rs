//! Crate-wide error type for the transfer and transcode engine.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the engine.
///
/// Worker errors are stored on their Transfer and reported through listings;
/// they never abort a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transfer or download not found")]
    NotFound,

    #[error("invalid or unrecognized transfer target {0:?}")]
    InvalidTarget(String),

    #[error("missing or invalid download id {0:?}")]
    InvalidDownloadId(String),

    #[error("no files found for download")]
    NoFiles,

    #[error("insufficient storage")]
    InsufficientStorage,

    #[error("download directory {} already exists", .0.display())]
    NameConflict(PathBuf),

    #[error("video encoder not found on PATH")]
    EncoderMissing,

    #[error("video encoder failed: {0}")]
    EncoderFailed(String),

    #[error("transcoded output is too small")]
    UndersizedOutput,

    #[error("invalid friend host {0:?}")]
    InvalidFriendHost(String),

    /// HTTP, file-system and torrent-client faults.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a transport-layer failure that only has a message.
    pub fn transport(msg: impl Into<String>) -> Error {
        Error::Transport(msg.into().into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(Box::new(err))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Transport(err.into())
    }
}
