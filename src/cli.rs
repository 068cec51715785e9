//! Command line flags.

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "watcher", disable_version_flag = true)]
pub struct Flags {
    /// Download directory
    #[arg(long = "download-dir", default_value = "/data")]
    pub download_dir: PathBuf,

    /// Listen address
    #[arg(long = "http-addr", default_value = ":80")]
    pub http_addr: String,

    /// HTTP host
    #[arg(long = "http-host", default_value = "")]
    pub http_host: String,

    /// HTTP URL prefix
    #[arg(long = "http-prefix", default_value = "/watcher")]
    pub http_prefix: String,

    /// HTTP basic auth username
    #[arg(long = "http-username", default_value = "watcher")]
    pub http_username: String,

    /// Listen address for the torrent client
    #[arg(long = "torrent-addr", default_value = ":61337")]
    pub torrent_addr: String,

    /// Reverse proxy auth IP
    #[arg(long = "reverse-proxy-ip", default_value = "")]
    pub reverse_proxy_ip: String,

    /// Reverse proxy auth header
    #[arg(long = "reverse-proxy-header", default_value = "X-Authenticated-User")]
    pub reverse_proxy_header: String,

    /// Also maintain the basic auth password when behind a reverse proxy
    #[arg(long = "proxy-password")]
    pub proxy_password: bool,

    /// Backlink (optional)
    #[arg(long, default_value = "")]
    pub backlink: String,

    /// Enable TLS using Let's Encrypt
    #[arg(long)]
    pub letsencrypt: bool,

    /// Use the link-local metadata service for friend persistence
    #[arg(long)]
    pub metadata: bool,

    /// Debug logging
    #[arg(long)]
    pub debug: bool,

    /// Display version and exit
    #[arg(long)]
    pub version: bool,
}

/// Split a `host:port` listen address, defaulting an empty host to all
/// interfaces.
pub fn listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let (host, port) = split_host_port(addr)?;
    let ip: IpAddr = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse()?
    };
    Ok(SocketAddr::new(ip, port))
}

/// The port of a `host:port` address.
pub fn port_of(addr: &str) -> anyhow::Result<u16> {
    Ok(split_host_port(addr)?.1)
}

fn split_host_port(addr: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid listen address {addr:?}"))?;
    Ok((host.to_string(), port.parse()?))
}
