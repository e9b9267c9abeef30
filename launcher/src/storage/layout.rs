//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the launcher
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Persisted deployment state file
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    /// Directory holding rendered proxy configuration
    pub fn proxy_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("proxy"))
    }

    /// Active proxy configuration file
    pub fn proxy_conf_file(&self) -> File {
        self.proxy_dir().file("launchpad.conf")
    }

    /// Candidate proxy configuration awaiting validation
    pub fn proxy_candidate_file(&self) -> File {
        self.proxy_dir().file("launchpad.candidate.conf")
    }

    /// Proxy engine pid file, referenced from the rendered configuration
    pub fn proxy_pid_file(&self) -> File {
        self.proxy_dir().file("nginx.pid")
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::LauncherError> {
        Dir::new(self.base_dir.clone()).create().await?;
        self.proxy_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        // Use /var/lib/launchpad on Linux, or user home directory elsewhere
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/launchpad");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".launchpad");

        Self::new(base_dir)
    }
}

// Add dirs crate functionality inline for cross-platform support
#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
