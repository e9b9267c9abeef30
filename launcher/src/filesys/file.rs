//! File operations
//!
//! All durable launcher artifacts (state file, credential file, proxy
//! configuration) are written through the atomic helpers here so a crash
//! mid-write never leaves a partially-written file behind.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::LauncherError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, LauncherError> {
        let mut file = fs::File::open(&self.path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        Ok(contents)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, LauncherError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Atomic write using a temporary file in the same directory
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), LauncherError> {
        self.write_atomic_with_mode(contents, None).await
    }

    /// Atomic write that also restricts the file to owner read/write (0600).
    ///
    /// The mode is applied to the temporary file before the rename so the
    /// final path is never observable with looser permissions.
    pub async fn write_secret_atomic(&self, contents: &[u8]) -> Result<(), LauncherError> {
        self.write_atomic_with_mode(contents, Some(0o600)).await
    }

    async fn write_atomic_with_mode(
        &self,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), LauncherError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata().await?.permissions();
            perms.set_mode(mode);
            fs::set_permissions(&temp_path, perms).await?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Atomic JSON write
    pub async fn write_json_atomic<T: Serialize>(&self, value: &T) -> Result<(), LauncherError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_atomic(contents.as_bytes()).await
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), LauncherError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_atomic_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("sample.json"));

        file.write_json_atomic(&serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let value: serde_json::Value = file.read_json().await.unwrap();
        assert_eq!(value["ok"], true);

        // No stray temp file after the rename
        assert!(!dir.path().join("sample.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_secret_write_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join(".env"));
        file.write_secret_atomic(b"TOKEN=abc\n").await.unwrap();

        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
