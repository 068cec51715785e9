//! watcher - a self-hosted media acquisition and streaming server.
//!
//! Acquisition targets (magnet links, torrent metadata URLs, friend URLs)
//! are fetched into the download directory, optionally transcoded into a
//! streamable mp4, and exposed over HTTP for streaming, download and
//! peer-to-peer sharing with whitelisted friend instances.

mod cli;
mod config;
mod disk;
mod error;
mod friends;
mod library;
mod logtail;
mod secret;
mod server;
mod thumbnail;
mod torrent;
mod transcode;
mod transfer;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};

use crate::config::Config;
use crate::disk::DiskInfo;
use crate::friends::Friends;
use crate::logtail::LogTail;
use crate::secret::Secret;
use crate::server::AuthSettings;
use crate::torrent::{RqbitClient, RqbitOptions, TorrentClient};
use crate::transcode::Transcoder;
use crate::transfer::{Engine, SpaceProbe};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default torrent rate ceilings, in megabits per second.
const UPLOAD_MBPS: u64 = 100;
const DOWNLOAD_MBPS: u64 = 200;

/// Application state shared across request handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub prefix: String,
    pub http_host: String,
    pub backlink: String,
    pub config: Config,
    pub engine: Engine,
    pub transcoder: Transcoder,
    pub friends: Friends,
    pub logtail: LogTail,
    pub auth: AuthSettings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let flags = cli::Flags::parse();

    if flags.version {
        println!("watcher {VERSION}");
        return Ok(());
    }
    if flags.http_host.trim().is_empty() {
        cli::Flags::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "missing HTTP host",
            )
            .exit();
    }

    let logtail = LogTail::new(200 * 1024);
    let writer_tail = logtail.clone();
    let level = if flags.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(move || writer_tail.tee_writer())
        .init();

    info!("starting watcher {VERSION}");

    let root = flags.download_dir.clone();
    std::fs::create_dir_all(&root)?;

    let config = Config::load(&root)?;

    // No trailing slash, please.
    let prefix = flags.http_prefix.trim_end_matches('/').to_string();

    // Secrets live beside the library. The feed secret always exists; the
    // basic auth password only when basic auth can apply.
    let _feed_secret = Secret::attach(root.join(".feedsecret"));
    let reverse_proxy_ip = if flags.reverse_proxy_ip.is_empty() {
        None
    } else {
        Some(flags.reverse_proxy_ip.parse()?)
    };
    let password = if reverse_proxy_ip.is_none() || flags.proxy_password {
        Some(Arc::new(Secret::attach(root.join(".password"))))
    } else {
        None
    };

    // One process-wide torrent session with global rate ceilings.
    let torrent_port = cli::port_of(&flags.torrent_addr)?;
    let torrent_client = RqbitClient::new(
        &root,
        RqbitOptions {
            listen_port: torrent_port,
            upload_bps: UPLOAD_MBPS * 1024 * 1024 / 8,
            download_bps: DOWNLOAD_MBPS * 1024 * 1024 / 8,
        },
    )
    .await
    .map_err(|err| anyhow::anyhow!("torrent client: {err}"))?;

    let space_root = root.clone();
    let space: SpaceProbe = Arc::new(move || Ok(DiskInfo::probe(&space_root)?.free));

    let engine = Engine::new(
        root.clone(),
        prefix.clone(),
        config.clone(),
        Arc::new(torrent_client) as Arc<dyn TorrentClient>,
        space,
    )
    .map_err(|err| anyhow::anyhow!("transfer engine: {err}"))?;
    engine.start();

    let transcoder = Transcoder::new(0, config.get().transcode_min_divisor);
    transcoder.start();

    let friends = if flags.metadata {
        Friends::metadata_store()
    } else {
        Friends::file_store(&root).map_err(|err| anyhow::anyhow!("friends store: {err}"))?
    };

    if flags.letsencrypt {
        // Certificate acquisition is left to the fronting proxy.
        warn!("--letsencrypt is set but TLS termination is delegated to the reverse proxy");
    }

    if let Some(password) = &password {
        info!(
            "login credentials:  {}  /  {}",
            flags.http_username,
            password.get()
        );
    }

    let state = AppState {
        root,
        prefix: prefix.clone(),
        http_host: flags.http_host.clone(),
        backlink: flags.backlink.clone(),
        config,
        engine,
        transcoder,
        friends,
        logtail,
        auth: AuthSettings {
            reverse_proxy_ip,
            reverse_proxy_header: flags.reverse_proxy_header.clone(),
            username: flags.http_username.clone(),
            password,
        },
    };

    let addr = cli::listen_addr(&flags.http_addr)?;
    info!(
        "serving http://{}{}/ for host {}",
        addr, prefix, flags.http_host
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        server::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
