pub mod containers;
pub mod health;
pub mod logs;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{config::RelayConfig, runtime::ContainerRuntime};

/// State shared across axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub config: Arc<RelayConfig>,
    /// Cancelled when the server shuts down; every WebSocket connection
    /// derives its own token from it.
    pub shutdown: CancellationToken,
}
