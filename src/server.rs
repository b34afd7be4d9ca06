use std::{net::SocketAddr, sync::Arc};

use axum::{Router, middleware, routing::get};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RelayConfig,
    handler::{AppState, containers::list_containers, health::health, logs::ws_logs},
    middleware::{access_log, correlation_id, cors_layer},
    runtime::ContainerRuntime,
};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid CORS origin: {0}")]
    CorsOrigin(#[from] http::header::InvalidHeaderValue),
    #[error("Server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub fn router(state: AppState) -> Result<Router, ServerError> {
    let cors = cors_layer(&state.config.cors_origin)?;

    // Layers run outermost last: CORS, then correlation id, then access log.
    Ok(Router::new()
        .route("/health", get(health))
        .route("/api/containers", get(list_containers))
        .route("/ws/logs", get(ws_logs))
        .with_state(state)
        .layer(middleware::from_fn(access_log))
        .layer(middleware::from_fn(correlation_id))
        .layer(cors))
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Serves until SIGINT/SIGTERM, then closes every WebSocket connection and
/// waits at most `shutdown_timeout` for in-flight work.
pub async fn run(config: RelayConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<(), ServerError> {
    let shutdown = CancellationToken::new();
    let shutdown_timeout = config.shutdown_timeout();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let state = AppState {
        runtime,
        config: Arc::new(config),
        shutdown: shutdown.clone(),
    };
    let app = router(state)?;

    info!("Starting log-streamer server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    let signal_token = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                wait_for_signal().await;
                let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
                info!("Shutting down server...");
                signal_token.cancel();
            })
            .await
    });

    tokio::select! {
        result = &mut server => return Ok(result??),
        _ = shutdown.cancelled() => {}
    }

    match tokio::time::timeout(shutdown_timeout, server).await {
        Ok(result) => result??,
        Err(_) => warn!(
            "Graceful shutdown did not finish within {:?}",
            shutdown_timeout
        ),
    }
    Ok(())
}
