//! Pulling a download from a friend instance over its peer REST interface.
//!
//! The target URL names the peer's file-list endpoint; each listed file is
//! then streamed straight to disk. Friend transfers never seed.

use super::{sentinel, worker, Engine, Marker};
use crate::error::{Error, Result};
use crate::thumbnail;
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
struct FriendFile {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Size")]
    size: u64,
}

pub(super) async fn pull(
    engine: &Engine,
    id: &str,
    url: &Url,
    me: &str,
    token: &CancellationToken,
) -> Result<()> {
    // The file list is small; fetched with a plain client timeout.
    let body = worker::fetch_limited(engine.http(), url.clone(), worker::HTTP_READ_LIMIT, None)
        .await?;
    let files: Vec<FriendFile> =
        serde_json::from_slice(&body).map_err(|err| Error::Transport(Box::new(err)))?;
    if files.is_empty() {
        return Err(Error::NoFiles);
    }

    let download_id = validate_download_id(url)?;
    let download_size: u64 = files.iter().map(|file| file.size).sum();
    if !engine.available_storage(download_size)? {
        return Err(Error::InsufficientStorage);
    }

    let download_dir = engine.root().join(&download_id);
    engine.with_transfer(id, |t| {
        t.download_id = Some(download_id.clone());
        t.download_size = download_size;
        t.download_dir = Some(download_dir.clone());
    });
    sentinel::mark(&download_dir, Marker::Downloading)?;

    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidTarget(url.to_string()))?;
    let port = url.port();

    for file in &files {
        let target = download_dir.join(&file.id);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let endpoint = stream_url(
            url.scheme(),
            host,
            port,
            engine.http_prefix(),
            &download_id,
            &file.id,
            me,
        )?;
        debug!(file = %file.id, endpoint = %endpoint, "downloading friend file");
        fetch_to_file(engine.http(), endpoint, &target, token).await?;
    }

    thumbnail::post_process(&download_dir).await;
    sentinel::unmark(&download_dir, Marker::Downloading)?;
    Ok(())
}

/// The download id is the last segment of the file-list path.
fn validate_download_id(url: &Url) -> Result<String> {
    let id = url
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or_default()
        .to_string();
    if id.len() < 3 || id.len() > 200 {
        return Err(Error::InvalidDownloadId(id));
    }
    Ok(id)
}

fn stream_url(
    scheme: &str,
    host: &str,
    port: Option<u16>,
    prefix: &str,
    download_id: &str,
    file_id: &str,
    me: &str,
) -> Result<Url> {
    let file_path = file_id
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    let authority = match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let raw = format!(
        "{scheme}://{authority}{prefix}/v1/downloads/stream/{}/{file_path}?friend={}",
        urlencoding::encode(download_id),
        urlencoding::encode(me),
    );
    Url::parse(&raw).map_err(|_| Error::InvalidTarget(raw))
}

/// Stream a response body straight to a file, watching the worker's
/// cancellation token at every read boundary. Partial files stay in place on
/// failure; removing the transfer cleans them up.
async fn fetch_to_file(
    client: &reqwest::Client,
    url: Url,
    target: &Path,
    token: &CancellationToken,
) -> Result<()> {
    let response = tokio::select! {
        _ = token.cancelled() => return Err(Error::transport("transfer canceled")),
        response = client.get(url).send() => response?,
    };
    if !response.status().is_success() {
        return Err(Error::transport(format!(
            "friend stream request failed: {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(target).await?;
    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                return Err(Error::transport("transfer canceled"));
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => file.write_all(&bytes).await?,
                Some(Err(err)) => return Err(err.into()),
                None => break,
            }
        }
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::torrent::mock::MockClient;
    use crate::torrent::TorrentClient;
    use crate::transfer::{marked, SpaceProbe};
    use axum::body::Body;
    use axum::extract::Path as AxumPath;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn engine(root: &Path) -> (crate::transfer::Engine, Config) {
        let config = Config::load(root).unwrap();
        let space: SpaceProbe = Arc::new(|| Ok(1 << 40));
        let engine = crate::transfer::Engine::new(
            root.to_path_buf(),
            "/watcher".to_string(),
            config.clone(),
            MockClient::new() as Arc<dyn TorrentClient>,
            space,
        )
        .unwrap();
        (engine, config)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn list_url(addr: SocketAddr, id: &str) -> String {
        format!("http://{addr}/watcher/v1/downloads/files/{id}?friend=me.example.com")
    }

    /// A minimal peer serving one download with three files, one of them in
    /// a subdirectory. When `stall` is set, the second file never finishes.
    async fn peer(stall: bool) -> SocketAddr {
        let files = Json(serde_json::json!([
            { "ID": "a.mp4", "Size": 100 },
            { "ID": "b/c.mp4", "Size": 200 },
            { "ID": "d.mp4", "Size": 50 },
        ]));
        let app = Router::new()
            .route(
                "/watcher/v1/downloads/files/{id}",
                get(move || async move { files }),
            )
            .route(
                "/watcher/v1/downloads/stream/{id}/{*file}",
                get(move |AxumPath((_, file)): AxumPath<(String, String)>| async move {
                    let size = match file.as_str() {
                        "a.mp4" => 100,
                        "b/c.mp4" => 200,
                        "d.mp4" => 50,
                        _ => return Body::from("missing"),
                    };
                    if stall && file == "b/c.mp4" {
                        let chunk: std::result::Result<Vec<u8>, std::io::Error> =
                            Ok(vec![0u8; 10]);
                        return Body::from_stream(
                            futures_util::stream::iter([chunk])
                                .chain(futures_util::stream::pending()),
                        );
                    }
                    Body::from(vec![0u8; size])
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn download_id_length_bounds() {
        let url = |id: &str| {
            Url::parse(&format!("https://peer/watcher/v1/downloads/files/{id}")).unwrap()
        };
        assert!(validate_download_id(&url(&"a".repeat(2))).is_err());
        assert!(validate_download_id(&url(&"a".repeat(3))).is_ok());
        assert!(validate_download_id(&url(&"a".repeat(200))).is_ok());
        assert!(validate_download_id(&url(&"a".repeat(201))).is_err());
    }

    #[test]
    fn stream_url_encodes_segments() {
        let url = stream_url(
            "https",
            "peer.example.com",
            None,
            "/watcher",
            "movieA",
            "sub dir/a file.mp4",
            "me.example.com",
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://peer.example.com/watcher/v1/downloads/stream/movieA/sub%20dir/a%20file.mp4?friend=me.example.com"
        );
    }

    #[tokio::test]
    async fn pulls_all_listed_files() {
        let addr = peer(false).await;
        let tmp = tempdir().unwrap();
        let (engine, _config) = engine(tmp.path());

        let t = engine.add(&list_url(addr, "movieA")).unwrap();
        engine.tick();

        let check = engine.clone();
        let id = t.id.clone();
        wait_until(move || check.find(&id).map(|t| t.is_completed()).unwrap_or(false)).await;

        let done = engine.find(&t.id).unwrap();
        assert!(done.error.is_none(), "unexpected error: {:?}", done.error);
        assert_eq!(done.download_id.as_deref(), Some("movieA"));
        assert_eq!(done.download_size, 350);

        let dir = tmp.path().join("movieA");
        for (file, size) in [("a.mp4", 100), ("b/c.mp4", 200), ("d.mp4", 50)] {
            assert_eq!(std::fs::metadata(dir.join(file)).unwrap().len(), size);
        }
        assert!(!marked(&dir, crate::transfer::Marker::Downloading));
    }

    #[tokio::test]
    async fn short_download_id_is_rejected() {
        let addr = peer(false).await;
        let tmp = tempdir().unwrap();
        let (engine, _config) = engine(tmp.path());

        let t = engine.add(&list_url(addr, "ab")).unwrap();
        engine.tick();

        let check = engine.clone();
        let id = t.id.clone();
        wait_until(move || check.find(&id).map(|t| t.is_completed()).unwrap_or(false)).await;

        let done = engine.find(&t.id).unwrap();
        assert!(done
            .error
            .as_deref()
            .unwrap()
            .contains("invalid download id"));
        assert!(!tmp.path().join("ab").exists());
    }

    #[tokio::test]
    async fn cancel_mid_file_removes_partial_download() {
        let addr = peer(true).await;
        let tmp = tempdir().unwrap();
        let (engine, _config) = engine(tmp.path());

        let t = engine.add(&list_url(addr, "movieA")).unwrap();
        engine.tick();

        // Wait until the stalled second file is in flight.
        let dir = tmp.path().join("movieA");
        let first = dir.join("a.mp4");
        wait_until(move || first.exists()).await;

        engine.remove(&t.id).await.unwrap();
        assert!(!dir.exists());
        assert!(!tmp.path().join("movieA.downloading").exists());

        // The worker notices at its next read boundary and exits.
        let check = engine.clone();
        let id = t.id.clone();
        wait_until(move || check.find(&id).is_err()).await;
    }
}
