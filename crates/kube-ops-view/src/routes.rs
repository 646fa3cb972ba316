//! Route configuration for the view server.

use std::sync::Arc;

use axum::routing::{get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::ViewConfig;
use crate::handlers::{health_check, list_clusters};
use crate::state::ViewState;
use crate::websocket::ws_upgrade;

/// Create the view server router.
///
/// Anything not matched by an API route is served from the asset directory.
pub fn create_router(state: Arc<ViewState>) -> Router {
    let cors = build_cors_layer(state.config());
    let assets = ServeDir::new(&state.config().asset_path).append_index_html_on_directories(true);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .route("/clusters", get(list_clusters))
        .fallback_service(assets)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &ViewConfig) -> CorsLayer {
    if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
