//! Web server module: the operator API, the peer interface and streaming,
//! mounted under the configured HTTP prefix.

mod auth;
mod routes;

pub use auth::AuthSettings;

use crate::AppState;
use axum::response::Redirect;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    let inner = routes::routes(state.clone());

    let app = if state.prefix.is_empty() {
        inner
    } else {
        let target = format!("{}/", state.prefix);
        Router::new()
            .route(
                "/",
                get(move || async move { Redirect::to(&target) }),
            )
            .nest(&state.prefix, inner)
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}
