//! Command plan resolution
//!
//! Builds the resolved command sequence and environment for a run. Secrets
//! stay wrapped until the moment of process spawn; every external view
//! (dry-run reports, diagnostics) goes through the masked projection.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::profile::{CommandSpec, DeploymentProfile};
use crate::secrets::SECRET_MASK;

/// Resolved process environment for a run: secret entries from the
/// credential set plus plain entries derived from the request
pub struct ResolvedEnv {
    secret: Vec<(String, SecretString)>,
    plain: Vec<(String, String)>,
}

impl ResolvedEnv {
    pub fn new(secret: Vec<(String, SecretString)>, plain: Vec<(String, String)>) -> Self {
        Self { secret, plain }
    }

    /// Real values, for process spawn only
    pub fn materialized(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .secret
            .iter()
            .map(|(name, value)| (name.clone(), value.expose_secret().to_string()))
            .collect();
        env.extend(self.plain.iter().cloned());
        env
    }

    /// Masked view: every secret value replaced by the fixed mask
    pub fn masked(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .secret
            .iter()
            .map(|(name, _)| (name.clone(), SECRET_MASK.to_string()))
            .collect();
        env.extend(self.plain.iter().cloned());
        env
    }

    /// Credential entries, for the env-file materializer
    pub fn secret_entries(&self) -> &[(String, SecretString)] {
        &self.secret
    }

    /// The resolved workload version
    pub fn version(&self) -> Option<&str> {
        self.plain
            .iter()
            .find(|(name, _)| name == "VERSION")
            .map(|(_, value)| value.as_str())
    }
}

/// Resolve the environment for a deploy request
pub fn resolve_env(
    profile: &DeploymentProfile,
    credentials: Vec<(String, SecretString)>,
    version: Option<&str>,
) -> ResolvedEnv {
    let version = version
        .filter(|v| !v.is_empty())
        .unwrap_or(&profile.default_version);
    let plain = vec![("VERSION".to_string(), version.to_string())];
    ResolvedEnv::new(credentials, plain)
}

/// The deploy sequence: pre-commands in order, then the primary command
pub fn deploy_sequence(profile: &DeploymentProfile) -> Vec<CommandSpec> {
    let mut commands = profile.pre_commands.clone();
    commands.push(profile.command.clone());
    commands
}

/// The teardown sequence
pub fn uninstall_sequence(profile: &DeploymentProfile) -> Vec<CommandSpec> {
    profile.uninstall_commands.clone()
}

/// Dry-run report: the fully resolved plan with masked credentials
#[derive(Debug, Serialize, Deserialize)]
pub struct DryRunReport {
    pub dry_run: bool,
    pub profile_id: String,
    pub version: String,
    pub working_dir: String,
    pub environment: BTreeMap<String, String>,
    pub commands: Vec<String>,
    pub uninstall_commands: Vec<String>,
    pub message: String,
}

/// Build the dry-run report for a profile. Nothing here executes and no
/// state is touched.
pub fn dry_run_report(profile: &DeploymentProfile, env: &ResolvedEnv) -> DryRunReport {
    let environment = env.masked();
    DryRunReport {
        dry_run: true,
        profile_id: profile.id.clone(),
        version: environment.get("VERSION").cloned().unwrap_or_default(),
        working_dir: profile.working_dir.clone(),
        environment,
        commands: deploy_sequence(profile)
            .iter()
            .map(CommandSpec::display)
            .collect(),
        uninstall_commands: uninstall_sequence(profile)
            .iter()
            .map(CommandSpec::display)
            .collect(),
        message: "Dry run complete - no commands were executed".to_string(),
    }
}

/// Which compose engine front-end is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeFlavor {
    /// `docker compose` (plugin)
    PluginV2,

    /// `docker-compose` (standalone)
    StandaloneV1,
}

/// Detect the available compose engine, once per run
pub async fn detect_compose_flavor() -> Option<ComposeFlavor> {
    if probe(["docker", "compose", "version"]).await {
        debug!("Detected compose engine: docker compose (plugin)");
        return Some(ComposeFlavor::PluginV2);
    }
    if probe(["docker-compose", "version"]).await {
        debug!("Detected compose engine: docker-compose (standalone)");
        return Some(ComposeFlavor::StandaloneV1);
    }
    None
}

async fn probe<const N: usize>(argv: [&str; N]) -> bool {
    let status = Command::new(argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    matches!(
        tokio::time::timeout(Duration::from_secs(5), status).await,
        Ok(Ok(s)) if s.success()
    )
}

/// Rewrite the head of a compose invocation to whichever engine is
/// installed. Commands that do not invoke compose pass through untouched.
pub fn normalize_compose(spec: &CommandSpec, flavor: Option<ComposeFlavor>) -> CommandSpec {
    let Some(flavor) = flavor else {
        return spec.clone();
    };
    let argv = &spec.0;

    match flavor {
        ComposeFlavor::PluginV2 if argv.first().map(String::as_str) == Some("docker-compose") => {
            let mut rewritten = vec!["docker".to_string(), "compose".to_string()];
            rewritten.extend(argv[1..].iter().cloned());
            CommandSpec(rewritten)
        }
        ComposeFlavor::StandaloneV1
            if argv.len() >= 2 && argv[0] == "docker" && argv[1] == "compose" =>
        {
            let mut rewritten = vec!["docker-compose".to_string()];
            rewritten.extend(argv[2..].iter().cloned());
            CommandSpec(rewritten)
        }
        _ => spec.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_compose_upgrades_to_plugin() {
        let spec = CommandSpec::new(["docker-compose", "up", "-d"]);
        let rewritten = normalize_compose(&spec, Some(ComposeFlavor::PluginV2));
        assert_eq!(rewritten, CommandSpec::new(["docker", "compose", "up", "-d"]));
    }

    #[test]
    fn test_normalize_compose_downgrades_to_standalone() {
        let spec = CommandSpec::new(["docker", "compose", "down"]);
        let rewritten = normalize_compose(&spec, Some(ComposeFlavor::StandaloneV1));
        assert_eq!(rewritten, CommandSpec::new(["docker-compose", "down"]));
    }

    #[test]
    fn test_normalize_compose_leaves_other_commands() {
        let spec = CommandSpec::new(["helm", "install", "release", "./chart"]);
        assert_eq!(
            normalize_compose(&spec, Some(ComposeFlavor::PluginV2)),
            spec
        );
        assert_eq!(normalize_compose(&spec, None), spec);
    }

    #[test]
    fn test_masked_env_hides_secrets() {
        let env = ResolvedEnv::new(
            vec![("API_KEY".to_string(), SecretString::from("hunter2".to_string()))],
            vec![("VERSION".to_string(), "1.2".to_string())],
        );

        let masked = env.masked();
        assert_eq!(masked["API_KEY"], SECRET_MASK);
        assert_eq!(masked["VERSION"], "1.2");

        let materialized = env.materialized();
        assert!(materialized.contains(&("API_KEY".to_string(), "hunter2".to_string())));
    }
}
