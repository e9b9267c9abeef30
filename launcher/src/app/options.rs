//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::executor::ExecOptions;
use crate::discovery::DiscoveryOptions;
use crate::proxy::control::ProxyOptions;
use crate::storage::layout::StorageLayout;
use crate::workers;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Profile document location
    pub profiles_file: PathBuf,

    /// Help content location
    pub help_file: PathBuf,

    /// Profile forced active by the environment
    pub active_profile: Option<String>,

    /// Global dry-run override: every deploy becomes a preview
    pub dry_run_override: bool,

    /// Whether the front-end should offer the dry-run toggle
    pub show_dry_run: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Command execution options
    pub exec: ExecOptions,

    /// Discovery options
    pub discovery: DiscoveryOptions,

    /// Proxy engine options
    pub proxy: ProxyOptions,

    /// Proxy supervisor options
    pub proxy_worker: workers::proxy::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            profiles_file: PathBuf::from("profiles.json"),
            help_file: PathBuf::from("help-content.json"),
            active_profile: None,
            dry_run_override: false,
            show_dry_run: false,
            server: ServerOptions::default(),
            exec: ExecOptions::default(),
            discovery: DiscoveryOptions::default(),
            proxy: ProxyOptions::default(),
            proxy_worker: workers::proxy::Options::default(),
        }
    }
}

impl AppOptions {
    /// Build options from the process environment.
    ///
    /// Unset or unparsable variables fall back to the defaults; the
    /// launcher is meant to come up with zero mandatory configuration.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Some(dir) = env_var("LAUNCHER_DATA_DIR") {
            options.storage.layout = StorageLayout::new(dir);
        }
        if let Some(path) = env_var("LAUNCHER_PROFILES_FILE") {
            options.profiles_file = PathBuf::from(path);
        }
        if let Some(path) = env_var("LAUNCHER_HELP_FILE") {
            options.help_file = PathBuf::from(path);
        }
        if let Some(path) = env_var("LAUNCHER_STATIC_DIR") {
            options.server.static_dir = PathBuf::from(path);
        }
        options.active_profile = env_var("LAUNCHER_PROFILE");
        options.dry_run_override = env_flag("LAUNCHER_DRY_RUN");
        options.show_dry_run = options.dry_run_override || env_flag("LAUNCHER_SHOW_DRY_RUN");

        if let Some(port) = env_var("LAUNCHER_HTTP_PORT").and_then(|v| v.parse().ok()) {
            options.server.port = port;
        }
        if let Some(port) = env_var("LAUNCHER_PROXY_PORT").and_then(|v| v.parse().ok()) {
            options.proxy.listen_port = port;
        }
        if let Some(enabled) = env_var("LAUNCHER_PROXY_ENABLED") {
            options.proxy.enabled = parse_flag(&enabled);
        }
        if let Some(path) = env_var("LAUNCHER_UI_PATH") {
            options.proxy.ui_path = path;
        }
        if let Some(endpoint) = env_var("LAUNCHER_ADDRESS_ENDPOINT") {
            options.discovery.address_endpoint = endpoint;
        }
        if let Some(backend) = env_var("LAUNCHER_FALLBACK_BACKEND") {
            options.discovery.fallback_backend = backend;
        }

        // The proxy forwards UI traffic to the launcher's own listener
        options.proxy.ui_backend = format!("{}:{}", options.server.host, options.server.port);

        options
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_flag(name: &str) -> bool {
    env_var(name).map(|value| parse_flag(&value)).unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Lifecycle options for the launcher
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Front-end asset directory, served when present
    pub static_dir: PathBuf,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            static_dir: PathBuf::from("ui"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag("1"));
        assert!(parse_flag("Yes"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }
}
