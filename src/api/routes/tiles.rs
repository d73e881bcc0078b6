//! Status tile endpoint

use axum::{Json, extract::State};

use crate::api::{error::ApiResult, state::ApiState, types::TilesResponse};

/// GET /api/v1/tiles
///
/// Tiles are derived on every request; liveness probes are rate limited by
/// the liveness cache.
pub async fn list_tiles(State(state): State<ApiState>) -> ApiResult<Json<TilesResponse>> {
    let tiles = state.tiles.build_tiles(&state.tile_definitions).await?;

    Ok(Json(TilesResponse {
        count: tiles.len(),
        tiles,
    }))
}
