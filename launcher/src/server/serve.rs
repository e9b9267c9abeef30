//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::LauncherError;
use crate::server::handlers::{
    config_handler, deploy_cancel_handler, deploy_handler, deploy_logs_handler,
    deploy_status_handler, health_handler, help_handler, state_handler, uninstall_handler,
    version_handler,
};
use crate::server::state::ServerState;

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), LauncherError>>, LauncherError> {
    let mut app = Router::new()
        // Health and version
        .route("/healthz", get(health_handler))
        .route("/version", get(version_handler))
        // Profile metadata and help
        .route("/config", get(config_handler))
        .route("/help", get(help_handler))
        // Deployment lifecycle
        .route("/state", get(state_handler))
        .route("/deploy", post(deploy_handler))
        .route("/deploy/status", get(deploy_status_handler))
        .route("/deploy/logs", get(deploy_logs_handler))
        .route("/deploy/cancel", post(deploy_cancel_handler))
        .route("/uninstall", post(uninstall_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Front-end assets, when bundled alongside the launcher
    if options.static_dir.is_dir() {
        info!("Serving UI assets from {}", options.static_dir.display());
        app = app.fallback_service(
            ServeDir::new(&options.static_dir).append_index_html_on_directories(true),
        );
    }

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| LauncherError::Server(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| LauncherError::Server(e.to_string()))
    });

    Ok(handle)
}
