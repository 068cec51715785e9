//! Transcode pipeline: a FIFO of source files and bounded concurrent encodes
//! that publish atomically next to the source.
//!
//! The encoder writes to a dot-prefixed temp sibling, which library listings
//! never show; the rename to the final `.mp4` is the publication point.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct Transcoder {
    inner: Arc<Inner>,
}

struct Inner {
    concurrency: usize,
    /// Reject outputs smaller than `source size / min_divisor`.
    min_divisor: u64,
    encoder: PathBuf,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    queue: Vec<PathBuf>,
    running: HashMap<PathBuf, CancellationToken>,
}

impl Transcoder {
    /// `concurrency` of zero means one encode per host CPU.
    pub fn new(concurrency: usize, min_divisor: u64) -> Transcoder {
        let concurrency = if concurrency == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            concurrency
        };
        Transcoder {
            inner: Arc::new(Inner {
                concurrency,
                min_divisor: min_divisor.max(1),
                encoder: PathBuf::from("ffmpeg"),
                state: RwLock::new(State::default()),
            }),
        }
    }

    #[cfg(test)]
    fn with_encoder(concurrency: usize, min_divisor: u64, encoder: PathBuf) -> Transcoder {
        let transcoder = Transcoder::new(concurrency, min_divisor);
        Transcoder {
            inner: Arc::new(Inner {
                concurrency: transcoder.inner.concurrency,
                min_divisor: transcoder.inner.min_divisor,
                encoder,
                state: RwLock::new(State::default()),
            }),
        }
    }

    /// Spawn the queue manager. Call once.
    pub fn start(&self) {
        let transcoder = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                transcoder.tick();
            }
        });
    }

    /// One admission pass: move queue heads into running workers while
    /// capacity remains.
    pub(crate) fn tick(&self) {
        loop {
            let job = {
                let mut state = self.inner.state.write();
                if state.queue.is_empty() || state.running.len() >= self.inner.concurrency {
                    break;
                }
                let src = state.queue.remove(0);
                let kill = CancellationToken::new();
                state.running.insert(src.clone(), kill.clone());
                (src, kill)
            };
            debug!(job = %job.0.display(), "starting transcode");
            let transcoder = self.clone();
            tokio::spawn(async move {
                transcoder.transcode(job.0, job.1).await;
            });
        }
    }

    /// Queue a source file. Already queued or running paths are a no-op.
    pub fn add(&self, src: &Path) -> Result<()> {
        let meta = std::fs::metadata(src)?;
        if meta.is_dir() {
            return Err(Error::InvalidTarget(src.display().to_string()));
        }
        let mut state = self.inner.state.write();
        if state.queue.iter().any(|path| path == src) || state.running.contains_key(src) {
            return Ok(());
        }
        state.queue.push(src.to_path_buf());
        Ok(())
    }

    /// Dequeue a waiting job, or kill a running one.
    pub fn cancel(&self, src: &Path) -> Result<()> {
        let mut state = self.inner.state.write();
        if let Some(position) = state.queue.iter().position(|path| path == src) {
            info!(job = %src.display(), "dequeueing transcode");
            state.queue.remove(position);
            return Ok(());
        }
        match state.running.get(src) {
            Some(kill) => {
                info!(job = %src.display(), "killing transcode");
                kill.cancel();
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Whether the path is queued or currently encoding.
    pub fn active(&self, src: &Path) -> bool {
        let state = self.inner.state.read();
        state.queue.iter().any(|path| path == src) || state.running.contains_key(src)
    }

    pub fn busy(&self) -> bool {
        let state = self.inner.state.read();
        !state.queue.is_empty() || !state.running.is_empty()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.read().queue.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.read().running.len()
    }

    async fn transcode(&self, src: PathBuf, kill: CancellationToken) {
        let result = run_job(&self.inner.encoder, &src, self.inner.min_divisor, &kill).await;

        self.inner.state.write().running.remove(&src);

        // The temp output survives failed or killed jobs.
        let (tmp, _) = job_names(&src);
        if tmp.exists() {
            let _ = std::fs::remove_file(&tmp);
        }

        if let Err(err) = result {
            error!(job = %src.display(), error = %err, "transcode failed");
        }
    }
}

/// Temp and final output names for a source: `/dir/.base.mp4` and
/// `/dir/base.mp4`.
fn job_names(src: &Path) -> (PathBuf, PathBuf) {
    let dir = src.parent().unwrap_or(Path::new("."));
    let stem = src
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    (dir.join(format!(".{stem}.mp4")), dir.join(format!("{stem}.mp4")))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

async fn run_job(
    encoder: &Path,
    src: &Path,
    min_divisor: u64,
    kill: &CancellationToken,
) -> Result<()> {
    let src_size = std::fs::metadata(src)?.len();
    let (tmp, dst) = job_names(src);

    let mut child = Command::new(encoder)
        .arg("-y")
        .arg("-i")
        .arg(src)
        .args([
            "-codec:v",
            "libx264",
            "-crf",
            "25",
            "-bf",
            "2",
            "-flags",
            "+cgop",
            "-pix_fmt",
            "yuv420p",
            "-codec:a",
            "aac",
            "-strict",
            "-2",
            "-b:a",
            "384k",
            "-r:a",
            "48000",
            // Streaming needs the moov atom up front.
            "-movflags",
            "faststart",
            // Sparse audio/video frames otherwise overflow the muxer queue.
            "-max_muxing_queue_size",
            "500",
        ])
        .arg(&tmp)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::EncoderMissing,
            _ => Error::from(err),
        })?;

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };
    let status = match status {
        Some(status) => status?,
        None => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            info!(job = %src.display(), "transcode canceled");
            return Ok(());
        }
    };

    let output = stderr_task.await.unwrap_or_default();
    if !status.success() {
        return Err(Error::EncoderFailed(
            String::from_utf8_lossy(&output).trim().to_string(),
        ));
    }

    // Reject implausibly small outputs before publishing.
    let out_size = std::fs::metadata(&tmp)?.len();
    if out_size < src_size / min_divisor {
        std::fs::remove_file(&tmp)?;
        return Err(Error::UndersizedOutput);
    }

    std::fs::rename(&tmp, &dst)?;

    // Carry an existing thumbnail over to the new name.
    let old_thumb = sibling(src, ".thumbnail.png");
    if old_thumb.exists() {
        std::fs::rename(&old_thumb, sibling(&dst, ".thumbnail.png"))?;
    }

    std::fs::remove_file(src)?;
    info!(src = %src.display(), dst = %dst.display(), "transcode complete");
    Ok(())
}
