//! Proxy activation and hot reload
//!
//! A candidate configuration is always validated by the proxy engine
//! before it replaces the active one; a rejected candidate leaves the
//! previous configuration live. A successful activation is a hot reload:
//! the engine re-reads its configuration without dropping established
//! connections.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::discovery::RouteTable;
use crate::errors::LauncherError;
use crate::filesys::file::File;
use crate::proxy::config::{render, ProxyMode, RenderParams};
use crate::storage::layout::StorageLayout;

/// Proxy engine options
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Whether a proxy engine is managed at all. When disabled the
    /// configuration is still rendered and tracked so the rest of the
    /// system behaves identically.
    pub enabled: bool,

    /// Port the proxy listens on
    pub listen_port: u16,

    /// Launcher interface address (host:port)
    pub ui_backend: String,

    /// Sub-path under which the launcher stays reachable post-deployment
    pub ui_path: String,

    /// Proxy engine binary
    pub engine_binary: String,

    /// Timeout for engine invocations (validate, reload)
    pub command_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: 3000,
            ui_backend: "127.0.0.1:8080".to_string(),
            ui_path: "/launcher".to_string(),
            engine_binary: "nginx".to_string(),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// The configuration currently live in the proxy
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    pub mode: ProxyMode,
    pub table: Option<RouteTable>,
    pub text: String,
}

/// Owns the rendered configuration files and the activation sequence
pub struct ProxyController {
    options: ProxyOptions,
    conf_file: File,
    candidate_file: File,
    pid_file: File,
    current: RwLock<Option<ActiveConfig>>,
}

impl ProxyController {
    pub fn new(options: ProxyOptions, layout: &StorageLayout) -> Self {
        Self {
            options,
            conf_file: layout.proxy_conf_file(),
            candidate_file: layout.proxy_candidate_file(),
            pid_file: layout.proxy_pid_file(),
            current: RwLock::new(None),
        }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Path of the active configuration file, for the supervised engine
    pub fn conf_path(&self) -> &Path {
        self.conf_file.path()
    }

    /// The configuration currently live, if any was activated
    pub async fn active(&self) -> Option<ActiveConfig> {
        self.current.read().await.clone()
    }

    /// Render, validate, install and hot-reload a new configuration.
    ///
    /// On any failure the previously active configuration stays live and
    /// untouched.
    pub async fn activate(
        &self,
        mode: ProxyMode,
        table: Option<RouteTable>,
    ) -> Result<(), LauncherError> {
        let params = RenderParams {
            mode,
            listen_port: self.options.listen_port,
            ui_backend: &self.options.ui_backend,
            ui_path: &self.options.ui_path,
            pid_file: self.pid_file.path(),
            table: table.as_ref(),
        };
        let text = render(&params)?;

        if self.options.enabled {
            self.candidate_file.write_atomic(text.as_bytes()).await?;

            if let Err(e) = self.validate(self.candidate_file.path()).await {
                let _ = self.candidate_file.delete().await;
                return Err(e);
            }

            tokio::fs::rename(self.candidate_file.path(), self.conf_file.path()).await?;
            self.reload().await;
        } else {
            self.conf_file.write_atomic(text.as_bytes()).await?;
        }

        let mut current = self.current.write().await;
        *current = Some(ActiveConfig { mode, table, text });
        info!("Proxy configuration activated ({:?} mode)", mode);
        Ok(())
    }

    async fn validate(&self, path: &Path) -> Result<(), LauncherError> {
        let output = Command::new(&self.options.engine_binary)
            .args(["-t", "-q", "-c"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        let output = match tokio::time::timeout(self.options.command_timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(LauncherError::ConfigInvalid(format!(
                    "validator unavailable: {}",
                    e
                )));
            }
            Err(_) => {
                return Err(LauncherError::ConfigInvalid(
                    "validation timed out".to_string(),
                ));
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        stderr.truncate(500);
        Err(LauncherError::ConfigInvalid(format!(
            "validation failed: {}",
            stderr
        )))
    }

    /// Ask a running engine to re-read its configuration. Not running is
    /// fine: the supervisor starts it against the freshly installed file.
    async fn reload(&self) {
        if !self.pid_file.exists().await {
            debug!("Proxy engine not running, skipping reload");
            return;
        }

        let result = Command::new(&self.options.engine_binary)
            .args(["-s", "reload", "-c"])
            .arg(self.conf_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match tokio::time::timeout(self.options.command_timeout, result).await {
            Ok(Ok(status)) if status.success() => {
                info!("Proxy configuration hot-reloaded");
            }
            Ok(Ok(status)) => {
                warn!("Proxy reload exited with {}; supervisor will converge", status);
            }
            Ok(Err(e)) => {
                warn!("Failed to run proxy reload: {}", e);
            }
            Err(_) => {
                warn!("Proxy reload timed out");
            }
        }
    }
}
