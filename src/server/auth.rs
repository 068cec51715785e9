//! Request authentication: basic auth, reverse proxy trust and friend DNS.
//!
//! Exactly one of basic auth or reverse-proxy trust applies to operator
//! routes, chosen at startup. Peer routes additionally accept a `friend`
//! query parameter naming a host on the friends list whose DNS A records
//! must include the client address.

use crate::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
pub struct AuthSettings {
    pub reverse_proxy_ip: Option<IpAddr>,
    pub reverse_proxy_header: String,
    pub username: String,
    /// Basic auth password; absent only behind a trusted reverse proxy.
    pub password: Option<Arc<crate::secret::Secret>>,
}

/// The connecting address, falling back to loopback when the server runs
/// without connect info (tests).
pub fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub async fn require_user(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match authenticate_user(&state, &request) {
        Ok(user) => {
            debug!(%user, "authenticated");
            next.run(request).await
        }
        Err(response) => response,
    }
}

/// Peer routes: a non-empty `friend` parameter switches to DNS
/// authorization, anything else falls back to operator auth.
pub async fn require_friend(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match query_param(&request, "friend") {
        Some(host) if !host.is_empty() => {
            let client = client_ip(&request);
            let forwarded = request
                .headers()
                .get("X-Forwarded-For")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_string();
            if friend_allowed(&state, client, &forwarded, &host).await {
                debug!(friend = %host, "friend authenticated");
                next.run(request).await
            } else {
                error!(friend = %host, client = %client_ip(&request), "friend auth failed");
                StatusCode::NOT_FOUND.into_response()
            }
        }
        _ => require_user(State(state), request, next).await,
    }
}

fn authenticate_user(state: &AppState, request: &Request) -> Result<String, Response> {
    let client = client_ip(request);

    if let Some(proxy_ip) = state.auth.reverse_proxy_ip {
        // Behind a reverse proxy: trust its user header, nothing else.
        if client == proxy_ip {
            if let Some(user) = request
                .headers()
                .get(state.auth.reverse_proxy_header.as_str())
                .and_then(|value| value.to_str().ok())
                .filter(|user| !user.is_empty())
            {
                return Ok(user.to_string());
            }
        }
        error!(%client, "auth failed");
        return Err(StatusCode::NOT_FOUND.into_response());
    }

    let Some(password) = &state.auth.password else {
        error!("no authentication configured");
        return Err(StatusCode::NOT_FOUND.into_response());
    };

    if let Some((user, pass)) = basic_credentials(request) {
        if user == state.auth.username && pass == password.get() {
            return Ok(user);
        }
    }
    Err((
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"Login Required\"")],
        "Unauthorized",
    )
        .into_response())
}

fn basic_credentials(request: &Request) -> Option<(String, String)> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn friend_allowed(state: &AppState, client: IpAddr, forwarded: &str, host: &str) -> bool {
    // Must be on the friends list.
    if !state.friends.contains(host).await {
        return false;
    }

    // The claimed host's address records must cover the client, either
    // directly or through the trusted proxy's X-Forwarded-For.
    let Ok(addrs) = tokio::net::lookup_host((host, 443)).await else {
        return false;
    };

    for addr in addrs {
        let ip = addr.ip();
        if ip == client {
            return true;
        }
        if state.auth.reverse_proxy_ip == Some(client) && forwarded.contains(&ip.to_string()) {
            return true;
        }
    }
    false
}

pub fn query_param(request: &Request, name: &str) -> Option<String> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
