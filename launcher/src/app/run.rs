//! Main application run loop
//!
//! Supervises the two long-running tasks of the launcher: the HTTP control
//! plane and the reverse-proxy engine. Both are wired to a shared shutdown
//! channel and drained in order when the process receives a stop signal.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::deploy::machine::Phase;
use crate::errors::LauncherError;
use crate::proxy::ProxyMode;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::proxy;

/// Run the launcher
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), LauncherError> {
    info!("Initializing launcher...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let result = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await;
    if let Err(e) = result {
        error!("Failed to start launcher: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
        }
    }

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), LauncherError> {
    let app_state = Arc::new(AppState::init(options).await?);

    // The proxy engine starts against a known configuration: the recovered
    // post-deployment table when one survives a restart, pre-deployment
    // routing to the launcher UI otherwise.
    init_proxy_topology(&app_state).await;

    init_server(
        options,
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    init_proxy_worker(
        options.proxy_worker.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    Ok(())
}

async fn init_proxy_topology(app_state: &Arc<AppState>) {
    let snapshot = app_state.machine.snapshot().await;

    if snapshot.phase == Phase::Deployed {
        info!("Recovered deployed state, rebuilding routes...");
        match app_state
            .orchestrator
            .resolve_profile(snapshot.profile_id.as_deref())
        {
            Ok(profile) => {
                let profile = profile.clone();
                app_state.orchestrator.refresh_routes(&profile).await;
                return;
            }
            Err(e) => {
                warn!("Recovered state references unusable profile: {}", e);
            }
        }
    }

    if let Err(e) = app_state.proxy.activate(ProxyMode::Pre, None).await {
        warn!("Failed to activate pre-deployment routing: {}", e);
    }
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), LauncherError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(
        app_state.orchestrator.clone(),
        app_state.profiles.clone(),
        app_state.help_file.clone(),
        options.proxy.ui_path.clone(),
        options.show_dry_run,
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)?;
    Ok(())
}

fn init_proxy_worker(
    options: proxy::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), LauncherError> {
    info!("Initializing proxy supervisor...");

    let controller = app_state.proxy.clone();
    let proxy_handle = tokio::spawn(async move {
        proxy::run(
            &options,
            controller,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_proxy_worker_handle(proxy_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    server_handle: Option<JoinHandle<Result<(), LauncherError>>>,
    proxy_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            server_handle: None,
            proxy_worker_handle: None,
        }
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), LauncherError>>,
    ) -> Result<(), LauncherError> {
        if self.server_handle.is_some() {
            return Err(LauncherError::Shutdown("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub fn with_proxy_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), LauncherError> {
        if self.proxy_worker_handle.is_some() {
            return Err(LauncherError::Shutdown("proxy_handle already set".to_string()));
        }
        self.proxy_worker_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), LauncherError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), LauncherError> {
        info!("Shutting down launcher...");

        // 1. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| LauncherError::Shutdown(e.to_string()))??;
        }

        // 2. Proxy supervisor
        if let Some(handle) = self.proxy_worker_handle.take() {
            handle
                .await
                .map_err(|e| LauncherError::Shutdown(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
