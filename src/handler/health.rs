use axum::{Json, extract::State, http::StatusCode};

use super::AppState;

#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub docker: &'static str,
}

/// Reports whether the container engine answers a ping.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.runtime.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                docker: "connected",
            }),
        ),
        Err(e) => {
            log::warn!("Docker ping failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "ok",
                    docker: "disconnected",
                }),
            )
        }
    }
}
