//! Read-only HTTP API of the hub
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Liveness of the hub and its storage
//! - `GET /api/v1/targets` - Configured targets with their scheduling state
//! - `GET /api/v1/targets/:id/latest` - Newest snapshot of one target
//! - `GET /api/v1/tiles` - Status tiles, freshly derived
//!
//! Every route sits behind the bearer token middleware when a token is
//! configured.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::{HealthResponse, LatestSnapshotResponse, TargetInfo, TargetsResponse, TilesResponse};

use std::net::SocketAddr;

use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ApiConfig;

/// Router with all routes and layers, without binding a socket.
pub fn router(state: ApiState, auth_token: Option<String>) -> Router {
    let mut app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/targets", get(routes::targets::list_targets))
        .route(
            "/api/v1/targets/:id/latest",
            get(routes::targets::get_latest_snapshot),
        )
        .route("/api/v1/tiles", get(routes::tiles::list_tiles))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    app = app.layer(cors);

    if let Some(token) = auth_token.filter(|token| !token.is_empty()) {
        app = app.layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    app
}

/// Bind the API socket and serve it in a background task.
///
/// Returns the bound address.
pub async fn spawn_api_server(config: &ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {}", config.bind);

    let app = router(state, config.token.clone());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
