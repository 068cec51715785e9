//! Transfer workers: one task per admitted transfer.
//!
//! A worker owns its transfer until completion. It dispatches to the friend
//! pull path or the torrent path, keeps the sentinel markers honest, and
//! records the outcome on the registry record before exiting.

use super::{friend, sentinel, Engine, Marker};
use crate::error::{Error, Result};
use crate::thumbnail;
use chrono::Utc;
use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

/// Responses expected to be small (metainfo, file lists) are capped here.
pub(super) const HTTP_READ_LIMIT: usize = 10 * 1024 * 1024;

pub(super) async fn run(engine: Engine, id: String) {
    let token = CancellationToken::new();
    let Some(url) = engine.with_transfer(&id, |t| {
        t.cancel = Some(token.clone());
        t.url.clone()
    }) else {
        return;
    };

    let result = execute(&engine, &id, &url, &token).await;
    if let Err(err) = &result {
        error!(transfer = %id, error = %err, "transfer failed");
    }

    engine.with_transfer(&id, |t| {
        t.error = result.err().map(|err| err.to_string());
        t.completed_at = Some(Utc::now());
    });
    engine.wake();
}

async fn execute(engine: &Engine, id: &str, url: &Url, token: &CancellationToken) -> Result<()> {
    let files_prefix = format!("{}/v1/downloads/files/", engine.http_prefix());
    let me = url
        .query_pairs()
        .find(|(key, _)| key == "friend")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();

    if url.path().starts_with(&files_prefix) && !me.is_empty() {
        friend::pull(engine, id, url, &me, token).await
    } else {
        torrent(engine, id, url, token).await
    }
}

async fn torrent(engine: &Engine, id: &str, url: &Url, token: &CancellationToken) -> Result<()> {
    let handle = match url.scheme() {
        "magnet" => engine.torrent().add_magnet(url.as_str()).await?,
        "http" | "https" => {
            let bytes =
                fetch_limited(engine.http(), url.clone(), HTTP_READ_LIMIT, Some(token)).await?;
            engine.torrent().add_metainfo(bytes).await?
        }
        _ => return Err(Error::InvalidTarget(url.to_string())),
    };
    engine.with_transfer(id, |t| t.torrent = Some(handle.clone()));

    // Magnet metadata comes from the swarm and can take a while.
    let info = tokio::select! {
        _ = token.cancelled() => {
            let _ = handle.drop_torrent().await;
            return Ok(());
        }
        info = handle.wait_info() => info?,
    };
    engine.with_transfer(id, |t| t.name = Some(info.name.clone()));

    let total = info.total_length();
    if !engine.available_storage(total)? {
        let _ = handle.drop_torrent().await;
        return Err(Error::InsufficientStorage);
    }

    // Multi-file torrents already carry a wrapping directory named after the
    // torrent; a bare file gets one named after it, extension stripped.
    let root = engine.root();
    let (download_dir, output_dir) = if info.single_file {
        let stem = Path::new(&info.name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| info.name.clone());
        let dir = root.join(stem);
        if dir.exists() {
            let _ = handle.drop_torrent().await;
            return Err(Error::NameConflict(dir));
        }
        (dir.clone(), dir)
    } else {
        (root.join(&info.name), root.to_path_buf())
    };

    engine.with_transfer(id, |t| t.download_dir = Some(download_dir.clone()));

    // The marker goes down before the client writes its first byte, so a
    // concurrent library scan never sees a partial download.
    sentinel::mark(&download_dir, Marker::Downloading)?;
    handle.download_all(&output_dir).await?;

    let mut tick = tokio::time::interval(Duration::from_secs(3));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!(name = %info.name, "transfer canceled");
                sentinel::unmark(&download_dir, Marker::Downloading)?;
                sentinel::unmark(&download_dir, Marker::Uploading)?;
                return Ok(());
            }
            _ = tick.tick() => {}
        }

        let Some((uploading, target)) =
            engine.with_transfer(id, |t| (t.uploading, t.seed_ratio))
        else {
            return Ok(());
        };

        if uploading {
            let written = handle.bytes_uploaded();
            let ratio = if written > 0 && total > 0 {
                written as f64 / total as f64
            } else {
                0.0
            };
            debug!(written, total, ratio, target, "transfer seeding");
            if ratio >= target {
                handle.drop_torrent().await?;
                sentinel::unmark(&download_dir, Marker::Uploading)?;
                return Ok(());
            }
        } else {
            let remaining = handle.bytes_missing();
            debug!(remaining, "transfer downloading");
            if remaining == 0 {
                thumbnail::post_process(&download_dir).await;
                sentinel::unmark(&download_dir, Marker::Downloading)?;

                if target == 0.0 {
                    handle.drop_torrent().await?;
                    return Ok(());
                }

                engine.with_transfer(id, |t| t.uploading = true);
                sentinel::mark(&download_dir, Marker::Uploading)?;
            }
        }
    }
}

/// GET a URL into memory, truncated at `limit`. Without a cancellation scope
/// the request gets a 10 second client timeout instead.
pub(super) async fn fetch_limited(
    client: &reqwest::Client,
    url: Url,
    limit: usize,
    token: Option<&CancellationToken>,
) -> Result<Vec<u8>> {
    let mut request = client.get(url);
    if token.is_none() {
        request = request.timeout(Duration::from_secs(10));
    }

    let response = match token {
        Some(token) => tokio::select! {
            _ = token.cancelled() => return Err(Error::transport("transfer canceled")),
            response = request.send() => response?,
        },
        None => request.send().await?,
    };
    if !response.status().is_success() {
        return Err(Error::transport(format!(
            "request failed: {}",
            response.status()
        )));
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = match token {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(Error::transport("transfer canceled")),
                chunk = stream.next() => chunk,
            },
            None => stream.next().await,
        };
        match chunk {
            Some(Ok(bytes)) => {
                let room = limit - body.len();
                body.extend_from_slice(&bytes[..bytes.len().min(room)]);
                if body.len() == limit {
                    break;
                }
            }
            Some(Err(err)) => return Err(err.into()),
            None => break,
        }
    }
    Ok(body)
}
