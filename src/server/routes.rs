//! REST API routes: the operator API and the peer-to-peer v1 interface.

use super::auth;
use crate::config::Settings;
use crate::disk::DiskInfo;
use crate::error::Error;
use crate::library::{self, Download};
use crate::AppState;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::info;

/// Routes relative to the HTTP prefix.
pub fn routes(state: AppState) -> Router<AppState> {
    let operator = Router::new()
        .route("/", get(list_downloads))
        .route("/logs", get(logs))
        .route("/api/downloads", get(list_downloads))
        .route(
            "/api/downloads/{id}",
            get(download_detail).delete(remove_download),
        )
        .route(
            "/api/downloads/{id}/share",
            post(share_download).delete(unshare_download),
        )
        .route("/api/transfers", get(list_transfers).post(start_transfer))
        .route("/api/transfers/{id}", delete(cancel_transfer))
        .route(
            "/api/transcode",
            post(start_transcode).delete(cancel_transcode),
        )
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/friends", get(list_friends).post(add_friend))
        .route("/api/friends/{host}", delete(remove_friend))
        .route("/api/friends/{host}/downloads/{id}", post(friend_download))
        .route("/downloads/stream/{id}/{*file}", get(stream_file))
        .route("/downloads/save/{id}/{*file}", get(save_file))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_user,
        ));

    let peer = Router::new()
        .route("/v1/downloads", get(v1_downloads))
        .route("/v1/downloads/files/{id}", get(v1_files))
        .route("/v1/downloads/stream/{id}/{*file}", get(v1_stream))
        .layer(middleware::from_fn_with_state(state, auth::require_friend));

    operator.merge(peer).route("/v1/status", get(v1_status))
}

// ============ Error mapping ============

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::InvalidTarget(_) | Error::InvalidDownloadId(_) | Error::InvalidFriendHost(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

// ============ Logs ============

async fn logs(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.logtail.lines().join("\n"),
    )
}

// ============ Downloads ============

#[derive(Debug, Serialize)]
struct DownloadView {
    id: String,
    created: DateTime<Utc>,
    size: u64,
    shared: bool,
    thumbnail: bool,
    uploading: bool,
}

impl DownloadView {
    fn from(download: &Download) -> DownloadView {
        DownloadView {
            id: download.id.clone(),
            created: download.created,
            size: download.size(),
            shared: download.shared(),
            thumbnail: download.thumbnail(),
            uploading: download.uploading(),
        }
    }
}

#[derive(Debug, Serialize)]
struct FileView {
    id: String,
    size: u64,
    modified: DateTime<Utc>,
    viewable: bool,
    convertible: bool,
    clickable: bool,
    thumbnail: bool,
    transcoding: bool,
}

async fn list_downloads(
    State(state): State<AppState>,
) -> Result<Json<Vec<DownloadView>>, ApiError> {
    let downloads = library::list_downloads(&state.root)?;
    Ok(Json(downloads.iter().map(DownloadView::from).collect()))
}

async fn download_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let download = library::find_download(&state.root, &id)?;
    let files: Vec<FileView> = download
        .files(false)
        .into_iter()
        .map(|file| FileView {
            transcoding: state.transcoder.active(&file.path),
            viewable: file.viewable(),
            convertible: file.convertible(),
            clickable: file.clickable(),
            thumbnail: file.thumbnail(),
            id: file.id,
            size: file.size,
            modified: file.modified,
        })
        .collect();

    Ok(Json(serde_json::json!({
        "download": DownloadView::from(&download),
        "files": files,
    })))
}

async fn remove_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let download = library::find_download(&state.root, &id)?;
    info!(%id, "removing download");
    std::fs::remove_dir_all(download.path()).map_err(Error::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn share_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let download = library::find_download(&state.root, &id)?;
    download.share()?;
    Ok(Json(serde_json::json!({ "status": "success" })))
}

async fn unshare_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let download = library::find_download(&state.root, &id)?;
    download.unshare()?;
    Ok(Json(serde_json::json!({ "status": "success" })))
}

// ============ Transfers ============

#[derive(Debug, Serialize)]
struct TransferView {
    id: String,
    title: String,
    url: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    downloaded_bytes: u64,
    total_bytes: u64,
    uploaded_bytes: u64,
    seed_target_bytes: u64,
    uploading: bool,
    error: Option<String>,
}

impl TransferView {
    fn from(transfer: &crate::transfer::Transfer) -> TransferView {
        TransferView {
            id: transfer.id.clone(),
            title: transfer.title(),
            url: transfer.url.to_string(),
            created_at: transfer.created_at,
            started_at: transfer.started_at,
            downloaded_bytes: transfer.downloaded_bytes(),
            total_bytes: transfer.total_size(),
            uploaded_bytes: transfer.uploaded_bytes(),
            seed_target_bytes: transfer.seed_target_bytes(),
            uploading: transfer.uploading,
            error: transfer.error.clone(),
        }
    }
}

async fn list_transfers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active: Vec<TransferView> = state
        .engine
        .list_active()
        .iter()
        .map(TransferView::from)
        .collect();
    let pending: Vec<TransferView> = state
        .engine
        .list_pending()
        .iter()
        .map(TransferView::from)
        .collect();
    Json(serde_json::json!({ "active": active, "pending": pending }))
}

#[derive(Debug, Deserialize)]
struct StartTransferRequest {
    target: String,
}

async fn start_transfer(
    State(state): State<AppState>,
    Json(request): Json<StartTransferRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let transfer = state.engine.add(&request.target)?;
    Ok(Json(serde_json::json!({ "id": transfer.id })))
}

async fn cancel_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Transcoding ============

#[derive(Debug, Deserialize)]
struct TranscodeRequest {
    id: String,
    file: String,
}

async fn start_transcode(
    State(state): State<AppState>,
    Json(request): Json<TranscodeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let download = library::find_download(&state.root, &request.id)?;
    let file = download.find_file(&request.file)?;
    state.transcoder.add(&file.path)?;
    Ok(Json(serde_json::json!({ "status": "success" })))
}

async fn cancel_transcode(
    State(state): State<AppState>,
    Json(request): Json<TranscodeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let download = library::find_download(&state.root, &request.id)?;
    let file = download.find_file(&request.file)?;
    state.transcoder.cancel(&file.path)?;
    Ok(Json(serde_json::json!({ "status": "success" })))
}

// ============ Settings ============

#[derive(Debug, Serialize)]
struct SettingsView {
    #[serde(flatten)]
    settings: Settings,
    disk: DiskInfo,
    disk_used_percent: f64,
    transcode: TranscodeStats,
    backlink: String,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct TranscodeStats {
    queued: usize,
    running: usize,
}

async fn get_settings(State(state): State<AppState>) -> Result<Json<SettingsView>, ApiError> {
    let disk = DiskInfo::probe(&state.root).map_err(Error::from)?;
    Ok(Json(SettingsView {
        settings: state.config.get(),
        disk,
        disk_used_percent: disk.used_percent(),
        transcode: TranscodeStats {
            queued: state.transcoder.queued_count(),
            running: state.transcoder.running_count(),
        },
        backlink: state.backlink.clone(),
        version: env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    ratio: Option<f64>,
    transfer_slots: Option<usize>,
    accept_tos: Option<bool>,
}

async fn update_settings(
    State(state): State<AppState>,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<Settings>, ApiError> {
    if let Some(ratio) = request.ratio {
        state.config.set_ratio(ratio)?;
    }
    if let Some(slots) = request.transfer_slots {
        state.config.set_transfer_slots(slots)?;
    }
    if let Some(accept) = request.accept_tos {
        state.config.set_accept_tos(accept)?;
    }
    Ok(Json(state.config.get()))
}

// ============ Friends ============

async fn list_friends(
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::friends::Friend>>, ApiError> {
    Ok(Json(state.friends.list().await?))
}

#[derive(Debug, Deserialize)]
struct AddFriendRequest {
    host: String,
}

async fn add_friend(
    State(state): State<AppState>,
    Json(request): Json<AddFriendRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.friends.add(request.host.trim()).await?;
    Ok(Json(serde_json::json!({ "status": "success" })))
}

async fn remove_friend(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.friends.remove(&host).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start pulling one of a friend's shared downloads.
async fn friend_download(
    State(state): State<AppState>,
    Path((host, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let friend = state.friends.find(&host).await?;
    let target = format!(
        "https://{}{}/v1/downloads/files/{}?friend={}",
        friend.id,
        state.prefix,
        urlencoding::encode(&id),
        urlencoding::encode(&state.http_host),
    );
    let transfer = state.engine.add(&target)?;
    Ok(Json(serde_json::json!({ "id": transfer.id })))
}

// ============ Streaming ============

async fn stream_file(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let download = library::find_download(&state.root, &id)?;
    let file = download.find_file(&file)?;

    let mut response = serve_path(&file.path, request).await?;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=604800"),
    );
    Ok(response)
}

async fn save_file(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let download = library::find_download(&state.root, &id)?;
    let file = download.find_file(&file)?;

    let mut response = serve_path(&file.path, request).await?;
    if let Ok(value) = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        file.base().replace('"', "")
    )) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// Range-capable single file responder.
async fn serve_path(path: &std::path::Path, request: Request) -> Result<Response, ApiError> {
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => Ok(response.into_response()),
        Err(err) => Err(ApiError(Error::from(std::io::Error::other(err)))),
    }
}

// ============ Peer API v1 ============

#[derive(Debug, Serialize)]
struct PeerEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Size")]
    size: u64,
}

async fn v1_status(State(state): State<AppState>, request: Request) -> Response {
    // Special auth: localhost only.
    if !auth::client_ip(&request).is_loopback() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let status = if state.transcoder.busy() || state.engine.busy() {
        "busy"
    } else {
        "idle"
    };
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{status}\n"),
    )
        .into_response()
}

async fn v1_downloads(State(state): State<AppState>) -> Result<Json<Vec<PeerEntry>>, ApiError> {
    let downloads = library::list_downloads(&state.root)?;
    Ok(Json(
        downloads
            .iter()
            .filter(|download| download.shared())
            .map(|download| PeerEntry {
                id: download.id.clone(),
                size: download.size(),
            })
            .collect(),
    ))
}

async fn v1_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<PeerEntry>>, ApiError> {
    let download = library::find_download(&state.root, &id)?;
    if !download.shared() {
        return Err(ApiError(Error::NotFound));
    }
    Ok(Json(
        download
            .files(false)
            .into_iter()
            .map(|file| PeerEntry {
                id: file.id,
                size: file.size,
            })
            .collect(),
    ))
}

async fn v1_stream(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let download = library::find_download(&state.root, &id)?;
    if !download.shared() {
        return Err(ApiError(Error::NotFound));
    }
    let file = download.find_file(&file)?;
    serve_path(&file.path, request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::friends::Friends;
    use crate::logtail::LogTail;
    use crate::secret::Secret;
    use crate::server::{self, AuthSettings};
    use crate::torrent::mock::MockClient;
    use crate::torrent::TorrentClient;
    use crate::transcode::Transcoder;
    use crate::transfer::{Engine, SpaceProbe};
    use axum_test::TestServer;
    use base64::Engine as _;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        server: TestServer,
        state: AppState,
        _tmp: TempDir,
    }

    fn harness() -> Harness {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let config = Config::load(&root).unwrap();
        let space: SpaceProbe = Arc::new(|| Ok(1 << 40));
        let engine = Engine::new(
            root.clone(),
            "/watcher".to_string(),
            config.clone(),
            MockClient::new() as Arc<dyn TorrentClient>,
            space,
        )
        .unwrap();

        let state = AppState {
            root: root.clone(),
            prefix: "/watcher".to_string(),
            http_host: "media.example.com".to_string(),
            backlink: String::new(),
            config: config.clone(),
            engine,
            transcoder: Transcoder::new(1, 5),
            friends: Friends::file_store(&root).unwrap(),
            logtail: LogTail::new(64 * 1024),
            auth: AuthSettings {
                reverse_proxy_ip: None,
                reverse_proxy_header: "X-Authenticated-User".to_string(),
                username: "watcher".to_string(),
                password: Some(Arc::new(Secret::attach(root.join(".password")))),
            },
        };

        let server = TestServer::new(server::router(state.clone())).unwrap();
        Harness {
            server,
            state,
            _tmp: tmp,
        }
    }

    fn basic_auth(state: &AppState) -> HeaderValue {
        let secret = state.auth.password.as_ref().unwrap().get();
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("watcher:{secret}"));
        HeaderValue::from_str(&format!("Basic {encoded}")).unwrap()
    }

    #[tokio::test]
    async fn operator_routes_require_auth() {
        let h = harness();

        let response = h.server.get("/watcher/api/downloads").await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        response.assert_header("WWW-Authenticate", "Basic realm=\"Login Required\"");

        let response = h
            .server
            .get("/watcher/api/downloads")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn status_is_open_on_loopback() {
        let h = harness();
        let response = h.server.get("/watcher/v1/status").await;
        response.assert_status_ok();
        assert_eq!(response.text(), "idle\n");
    }

    #[tokio::test]
    async fn share_controls_peer_visibility() {
        let h = harness();
        let dir = h.state.root.join("Movie");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("a.mp4"), b"vvvv").unwrap();

        // Nothing shared, nothing listed.
        let response = h
            .server
            .get("/watcher/v1/downloads")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<Vec<serde_json::Value>>().len(), 0);

        let response = h
            .server
            .post("/watcher/api/downloads/Movie/share")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status_ok();

        let response = h
            .server
            .get("/watcher/v1/downloads")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        let listed = response.json::<Vec<serde_json::Value>>();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["ID"], "Movie");
        assert_eq!(listed[0]["Size"], 4);

        let response = h
            .server
            .get("/watcher/v1/downloads/files/Movie")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        let files = response.json::<Vec<serde_json::Value>>();
        assert_eq!(files[0]["ID"], "a.mp4");

        // Unshared downloads 404 on the peer interface.
        let response = h
            .server
            .delete("/watcher/api/downloads/Movie/share")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status_ok();
        let response = h
            .server
            .get("/watcher/v1/downloads/files/Movie")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn streaming_serves_ranges() {
        let h = harness();
        let dir = h.state.root.join("Movie");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("a.mp4"), b"0123456789").unwrap();

        let response = h
            .server
            .get("/watcher/downloads/stream/Movie/a.mp4")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status_ok();
        assert_eq!(response.as_bytes().as_ref(), b"0123456789");

        let response = h
            .server
            .get("/watcher/downloads/stream/Movie/a.mp4")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .add_header(header::RANGE, HeaderValue::from_static("bytes=0-3"))
            .await;
        response.assert_status(StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.as_bytes().as_ref(), b"0123");

        let response = h
            .server
            .get("/watcher/downloads/save/Movie/a.mp4")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status_ok();
        response.assert_header(header::CONTENT_DISPOSITION, "attachment; filename=\"a.mp4\"");
    }

    #[tokio::test]
    async fn transfers_round_trip() {
        let h = harness();

        let response = h
            .server
            .post("/watcher/api/transfers")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .json(&serde_json::json!({
                "target": "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaa&dn=Sample"
            }))
            .await;
        response.assert_status_ok();
        let id = response.json::<serde_json::Value>()["id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = h
            .server
            .get("/watcher/api/transfers")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["pending"][0]["id"], id.as_str());
        assert_eq!(body["pending"][0]["title"], "Sample");

        let response = h
            .server
            .delete(&format!("/watcher/api/transfers/{id}"))
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status(StatusCode::NO_CONTENT);

        let response = h
            .server
            .delete(&format!("/watcher/api/transfers/{id}"))
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn settings_update_persists() {
        let h = harness();

        let response = h
            .server
            .put("/watcher/api/settings")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .json(&serde_json::json!({ "ratio": 2.5 }))
            .await;
        response.assert_status_ok();
        assert_eq!(h.state.config.get().ratio, 2.5);

        let response = h
            .server
            .get("/watcher/api/settings")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["ratio"], 2.5);
        assert!(body["disk"]["total"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn friends_round_trip() {
        let h = harness();

        let response = h
            .server
            .post("/watcher/api/friends")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .json(&serde_json::json!({ "host": "peer.example.com" }))
            .await;
        response.assert_status_ok();

        let response = h
            .server
            .post("/watcher/api/friends")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .json(&serde_json::json!({ "host": "bad host!" }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        // Pulling from the friend registers a transfer against its peer URL.
        let response = h
            .server
            .post("/watcher/api/friends/peer.example.com/downloads/movieA")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status_ok();
        let transfer = &h.state.engine.list_pending()[0];
        assert_eq!(
            transfer.url.as_str(),
            "https://peer.example.com/watcher/v1/downloads/files/movieA?friend=media.example.com"
        );

        let response = h
            .server
            .delete("/watcher/api/friends/peer.example.com")
            .add_header(header::AUTHORIZATION, basic_auth(&h.state))
            .await;
        response.assert_status(StatusCode::NO_CONTENT);
    }
}
