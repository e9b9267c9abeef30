//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::machine::Machine;
use crate::deploy::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::errors::LauncherError;
use crate::filesys::file::File;
use crate::profile::ProfileSet;
use crate::proxy::control::ProxyController;

/// Main application state
pub struct AppState {
    /// Loaded profile document
    pub profiles: Arc<ProfileSet>,

    /// Deployment state machine
    pub machine: Arc<Machine>,

    /// Proxy controller
    pub proxy: Arc<ProxyController>,

    /// Deployment orchestrator
    pub orchestrator: Arc<Orchestrator>,

    /// Help content file
    pub help_file: Arc<File>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, LauncherError> {
        info!("Initializing application state...");

        options.storage.layout.setup().await?;

        let profiles =
            Arc::new(ProfileSet::load(&File::new(&options.profiles_file)).await?);

        let machine =
            Arc::new(Machine::load(Arc::new(options.storage.layout.state_file())).await);

        let proxy = Arc::new(ProxyController::new(
            options.proxy.clone(),
            &options.storage.layout,
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorOptions {
                active_profile: options.active_profile.clone(),
                dry_run_override: options.dry_run_override,
                exec: options.exec.clone(),
                discovery: options.discovery.clone(),
            },
            profiles.clone(),
            machine.clone(),
            proxy.clone(),
        ));

        let help_file = Arc::new(File::new(&options.help_file));

        Ok(Self {
            profiles,
            machine,
            proxy,
            orchestrator,
            help_file,
        })
    }
}
