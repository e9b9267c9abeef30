//! Server state

use std::sync::Arc;

use crate::deploy::orchestrator::Orchestrator;
use crate::filesys::file::File;
use crate::profile::ProfileSet;

/// Server state shared across handlers
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    pub profiles: Arc<ProfileSet>,
    pub help_file: Arc<File>,

    /// Sub-path under which the launcher UI stays reachable behind the
    /// proxy after deployment
    pub ui_path: String,

    /// Whether the front-end should offer the dry-run toggle
    pub show_dry_run: bool,
}

impl ServerState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        profiles: Arc<ProfileSet>,
        help_file: Arc<File>,
        ui_path: String,
        show_dry_run: bool,
    ) -> Self {
        Self {
            orchestrator,
            profiles,
            help_file,
            ui_path,
            show_dry_run,
        }
    }
}
