//! Error types for the deployment launcher

use thiserror::Error;

/// Main error type for the deployment launcher
#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("a deploy or uninstall is already in progress")]
    AlreadyRunning,

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("field is not declared by the active profile: {0}")]
    UnknownField(String),

    #[error("nothing to uninstall")]
    NothingToUninstall,

    #[error("command exited with code {exit_code}")]
    CommandFailed { exit_code: i32, tail: Vec<String> },

    #[error("command cancelled")]
    Cancelled,

    #[error("proxy configuration rejected: {0}")]
    ConfigInvalid(String),

    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("shutdown error: {0}")]
    Shutdown(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LauncherError {
    /// Stable machine-readable tag, surfaced in every API error body.
    pub fn kind(&self) -> &'static str {
        match self {
            LauncherError::Io(_) => "Io",
            LauncherError::Json(_) => "Json",
            LauncherError::Http(_) => "Http",
            LauncherError::AlreadyRunning => "AlreadyRunning",
            LauncherError::UnknownProfile(_) => "UnknownProfile",
            LauncherError::MissingRequiredField(_) => "MissingRequiredField",
            LauncherError::UnknownField(_) => "UnknownField",
            LauncherError::NothingToUninstall => "NothingToUninstall",
            LauncherError::CommandFailed { .. } => "CommandFailed",
            LauncherError::Cancelled => "Cancelled",
            LauncherError::ConfigInvalid(_) => "ConfigInvalid",
            LauncherError::DiscoveryUnavailable(_) => "DiscoveryUnavailable",
            LauncherError::Config(_) => "Config",
            LauncherError::Server(_) => "Server",
            LauncherError::Shutdown(_) => "Shutdown",
            LauncherError::Internal(_) => "Internal",
        }
    }
}

impl From<anyhow::Error> for LauncherError {
    fn from(err: anyhow::Error) -> Self {
        LauncherError::Internal(err.to_string())
    }
}
