//! Credential env-file materialization
//!
//! Turns the operator-supplied credential set into an `ENV_VAR=value` file
//! the external tooling reads. Only fields declared by the active profile
//! are ever written; the file is owner read/write only and replaced
//! atomically so a crash mid-write never leaves a partial file readable.

use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::errors::LauncherError;
use crate::filesys::file::File;
use crate::profile::DeploymentProfile;
use crate::secrets::CredentialSet;

/// The credential file for a profile, kept next to the workload definition
/// so compose-style tooling picks it up by convention.
pub fn credential_file(profile: &DeploymentProfile) -> File {
    File::new(Path::new(&profile.working_dir).join(".env"))
}

/// Validate a credential set against the profile's field allow-list.
///
/// Returns `(env_var, value)` pairs in profile declaration order. Unknown
/// field ids are rejected, required fields must be present and non-empty,
/// and values may not contain control characters (they would corrupt the
/// env file or smuggle extra variables into it).
pub fn validate_credentials(
    profile: &DeploymentProfile,
    mut credentials: CredentialSet,
) -> Result<Vec<(String, SecretString)>, LauncherError> {
    for id in credentials.keys() {
        if profile.field(id).is_none() {
            return Err(LauncherError::UnknownField(id.clone()));
        }
    }

    for field in &profile.input_fields {
        if let Some(value) = credentials.get(&field.id) {
            if value.expose_secret().chars().any(char::is_control) {
                return Err(LauncherError::Config(format!(
                    "field {} contains control characters",
                    field.id
                )));
            }
        }
        if field.required {
            let present = credentials
                .get(&field.id)
                .map(|v| !v.expose_secret().is_empty())
                .unwrap_or(false);
            if !present {
                return Err(LauncherError::MissingRequiredField(field.id.clone()));
            }
        }
    }

    let mut entries = Vec::new();
    for field in &profile.input_fields {
        if let Some(value) = credentials.remove(&field.id) {
            entries.push((field.env_var.clone(), value));
        }
    }
    Ok(entries)
}

/// Write the credential file. Idempotent: a previous file is replaced
/// atomically.
pub async fn materialize(
    entries: &[(String, SecretString)],
    file: &File,
) -> Result<(), LauncherError> {
    let mut contents = String::new();
    contents.push_str("# Generated by launchpad - do not commit\n");
    contents.push_str(&format!("# Created: {}\n\n", chrono::Utc::now().to_rfc3339()));
    for (env_var, value) in entries {
        contents.push_str(env_var);
        contents.push('=');
        contents.push_str(value.expose_secret());
        contents.push('\n');
    }

    file.write_secret_atomic(contents.as_bytes()).await?;
    info!("Credential file written to {}", file.path().display());
    Ok(())
}

/// Remove the credential file during uninstall cleanup
pub async fn remove(file: &File) -> Result<(), LauncherError> {
    file.delete().await?;
    info!("Credential file removed from {}", file.path().display());
    Ok(())
}
