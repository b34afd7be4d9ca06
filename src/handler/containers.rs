use axum::{Json, extract::State, http::StatusCode};

use super::AppState;
use crate::runtime::ContainerSummary;

#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Lists all containers known to the engine, stopped ones included.
pub async fn list_containers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ContainerSummary>>, (StatusCode, Json<ErrorResponse>)> {
    state.runtime.list_summaries().await.map(Json).map_err(|e| {
        log::error!("Failed to list containers: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("failed to list containers: {e}"),
            }),
        )
    })
}
