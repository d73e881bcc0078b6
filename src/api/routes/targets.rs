//! Target endpoints

use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, State},
};
use tracing::warn;

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::{LatestSnapshotResponse, TargetInfo, TargetsResponse},
};

/// GET /api/v1/targets
///
/// All targets in display order, with the scheduler's view of each.
pub async fn list_targets(State(state): State<ApiState>) -> ApiResult<Json<TargetsResponse>> {
    let targets = state.storage.list_targets().await?;

    // A stopped scheduler only hides scheduling state
    let mut schedules: HashMap<i64, _> = match state.scheduler.status().await {
        Ok(statuses) => statuses
            .into_iter()
            .map(|status| (status.target_id, status))
            .collect(),
        Err(e) => {
            warn!("scheduler status unavailable: {:#}", e);
            HashMap::new()
        }
    };

    let targets: Vec<TargetInfo> = targets
        .into_iter()
        .map(|target| {
            let schedule = schedules.remove(&target.id);
            TargetInfo::new(target, schedule)
        })
        .collect();

    Ok(Json(TargetsResponse {
        count: targets.len(),
        targets,
    }))
}

/// GET /api/v1/targets/:id/latest
pub async fn get_latest_snapshot(
    State(state): State<ApiState>,
    Path(target_id): Path<i64>,
) -> ApiResult<Json<LatestSnapshotResponse>> {
    if state.storage.get_target(target_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("target {target_id} not found")));
    }

    let snapshot = state
        .storage
        .latest_snapshot(target_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no snapshot for target {target_id}")))?;

    Ok(Json(LatestSnapshotResponse {
        target_id,
        snapshot,
    }))
}
