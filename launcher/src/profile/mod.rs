//! Deployment profile schema
//!
//! Profiles are declarative descriptions of one deployable target: the
//! command sequences to run, the input fields the operator must supply and
//! the backend services the workload exposes. The profile document is loaded
//! once at startup and validated up front; nothing in it is interpreted
//! ad hoc at use sites.

use serde::{Deserialize, Serialize};

use crate::errors::LauncherError;
use crate::filesys::file::File;

/// Template variables allowed in service URL templates.
pub const ALLOWED_PLACEHOLDERS: &[&str] = &["HOST_IP", "BASE_DOMAIN"];

/// One external command as an argument vector.
///
/// Commands are executed without a shell; the first element is the program,
/// the rest are arguments. Secrets reach commands through the environment
/// only, never through argv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandSpec(pub Vec<String>);

impl CommandSpec {
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(argv.into_iter().map(Into::into).collect())
    }

    /// The program to execute
    pub fn program(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// The program arguments
    pub fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or(&[])
    }

    /// Single-line rendering for logs and stream events
    pub fn display(&self) -> String {
        self.0.join(" ")
    }
}

/// One operator-supplied input field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFieldSpec {
    /// Field id as submitted by the front-end
    pub id: String,

    /// Environment variable the value is exported as
    pub env_var: String,

    /// Display label
    #[serde(default)]
    pub label: String,

    /// Whether the field must be provided on deploy
    #[serde(default)]
    pub required: bool,

    /// Whether the value is a secret (masked everywhere)
    #[serde(default = "default_true")]
    pub secret: bool,
}

/// One backend service exposed by the deployed workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name shown to the operator
    pub name: String,

    /// Display description
    #[serde(default)]
    pub description: String,

    /// Link template; may reference ${HOST_IP} and ${BASE_DOMAIN}
    pub url: String,

    /// Proxy path pattern for this service, in declaration order.
    /// Absent for link-only services that are not routed.
    #[serde(default)]
    pub path: Option<String>,

    /// Static upstream address (host:port)
    #[serde(default)]
    pub upstream: Option<String>,

    /// Optional platform introspection command whose stdout is the live
    /// upstream address, preferred over the static one when declared
    #[serde(default)]
    pub lookup: Option<CommandSpec>,
}

impl ServiceSpec {
    /// Whether the service participates in proxy routing
    pub fn is_routed(&self) -> bool {
        self.path.is_some()
    }
}

/// A named deployment target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentProfile {
    /// Profile id
    pub id: String,

    /// Display description
    #[serde(default)]
    pub description: String,

    /// Heading shown by the front-end
    #[serde(default)]
    pub heading: String,

    /// Working directory for all commands
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Host prefix token used to derive ${BASE_DOMAIN} from the inbound
    /// Host header (e.g. "studio")
    #[serde(default)]
    pub host_prefix: String,

    /// Selectable workload versions
    #[serde(default)]
    pub versions: Vec<String>,

    /// Version used when the request does not pick one
    #[serde(default)]
    pub default_version: String,

    /// Commands run before the primary command, in order
    #[serde(default)]
    pub pre_commands: Vec<CommandSpec>,

    /// Primary deployment command
    pub command: CommandSpec,

    /// Teardown commands, in order
    #[serde(default)]
    pub uninstall_commands: Vec<CommandSpec>,

    /// Operator input fields
    #[serde(default)]
    pub input_fields: Vec<InputFieldSpec>,

    /// Backend services exposed after deployment
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl DeploymentProfile {
    /// Look up an input field by id
    pub fn field(&self, id: &str) -> Option<&InputFieldSpec> {
        self.input_fields.iter().find(|f| f.id == id)
    }

    /// Services that carry a proxy route, in declaration order
    pub fn routed_services(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.iter().filter(|s| s.is_routed())
    }

    /// Whether the profile declares teardown commands
    pub fn has_uninstall(&self) -> bool {
        !self.uninstall_commands.is_empty()
    }
}

/// Project-level metadata carried alongside the profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileMeta {
    #[serde(default = "default_project_name")]
    pub project_name: String,
}

impl Default for ProfileMeta {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
        }
    }
}

/// The on-disk profile document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSet {
    #[serde(default)]
    pub meta: ProfileMeta,

    /// Profiles in declaration order; the first is active unless overridden
    pub profiles: Vec<DeploymentProfile>,
}

impl ProfileSet {
    /// Load and validate the profile document
    pub async fn load(file: &File) -> Result<Self, LauncherError> {
        let set: ProfileSet = file.read_json().await.map_err(|e| {
            LauncherError::Config(format!(
                "failed to load profiles from {}: {}",
                file.path().display(),
                e
            ))
        })?;
        set.validate()?;
        Ok(set)
    }

    /// Resolve the active profile: explicit id, else the first declared
    pub fn active(&self, id: Option<&str>) -> Result<&DeploymentProfile, LauncherError> {
        match id {
            Some(id) => self
                .profiles
                .iter()
                .find(|p| p.id == id)
                .ok_or_else(|| LauncherError::UnknownProfile(id.to_string())),
            None => self
                .profiles
                .first()
                .ok_or_else(|| LauncherError::Config("no profiles declared".to_string())),
        }
    }

    /// Validate the whole document
    pub fn validate(&self) -> Result<(), LauncherError> {
        if self.profiles.is_empty() {
            return Err(LauncherError::Config("no profiles declared".to_string()));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for profile in &self.profiles {
            if profile.id.is_empty() {
                return Err(LauncherError::Config("profile with empty id".to_string()));
            }
            if !seen_ids.insert(profile.id.as_str()) {
                return Err(LauncherError::Config(format!(
                    "duplicate profile id: {}",
                    profile.id
                )));
            }
            validate_profile(profile)?;
        }
        Ok(())
    }
}

fn validate_profile(profile: &DeploymentProfile) -> Result<(), LauncherError> {
    let commands = profile
        .pre_commands
        .iter()
        .chain(std::iter::once(&profile.command))
        .chain(profile.uninstall_commands.iter());
    for command in commands {
        if command.0.is_empty() || command.program().is_empty() {
            return Err(LauncherError::Config(format!(
                "profile {}: empty command",
                profile.id
            )));
        }
    }

    let mut field_ids = std::collections::HashSet::new();
    for field in &profile.input_fields {
        if field.id.is_empty() || !field_ids.insert(field.id.as_str()) {
            return Err(LauncherError::Config(format!(
                "profile {}: empty or duplicate field id",
                profile.id
            )));
        }
        if !is_valid_env_name(&field.env_var) {
            return Err(LauncherError::Config(format!(
                "profile {}: invalid env var name for field {}: {:?}",
                profile.id, field.id, field.env_var
            )));
        }
    }

    let mut service_names = std::collections::HashSet::new();
    for service in &profile.services {
        if service.name.is_empty() || !service_names.insert(service.name.as_str()) {
            return Err(LauncherError::Config(format!(
                "profile {}: empty or duplicate service name",
                profile.id
            )));
        }
        for placeholder in placeholders(&service.url) {
            if !ALLOWED_PLACEHOLDERS.contains(&placeholder.as_str()) {
                return Err(LauncherError::Config(format!(
                    "profile {}: service {} references unknown placeholder ${{{}}}",
                    profile.id, service.name, placeholder
                )));
            }
        }
        if let Some(path) = &service.path {
            if !path.starts_with('/') {
                return Err(LauncherError::Config(format!(
                    "profile {}: service {} route pattern must start with '/'",
                    profile.id, service.name
                )));
            }
            if service.upstream.is_none() && service.lookup.is_none() {
                return Err(LauncherError::Config(format!(
                    "profile {}: routed service {} declares neither upstream nor lookup",
                    profile.id, service.name
                )));
            }
        }
    }

    Ok(())
}

/// Extract `${NAME}` placeholder names from a template
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        rest = &rest[start + 2..];
        match rest.find('}') {
            Some(end) => {
                names.push(rest[..end].to_string());
                rest = &rest[end + 1..];
            }
            None => break,
        }
    }
    names
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn default_true() -> bool {
    true
}

fn default_working_dir() -> String {
    ".".to_string()
}

fn default_project_name() -> String {
    "Launchpad".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> DeploymentProfile {
        DeploymentProfile {
            id: "compose".to_string(),
            description: String::new(),
            heading: String::new(),
            working_dir: ".".to_string(),
            host_prefix: "studio".to_string(),
            versions: vec![],
            default_version: String::new(),
            pre_commands: vec![CommandSpec::new(["docker", "compose", "pull"])],
            command: CommandSpec::new(["docker", "compose", "up", "-d"]),
            uninstall_commands: vec![CommandSpec::new(["docker", "compose", "down"])],
            input_fields: vec![InputFieldSpec {
                id: "api_key".to_string(),
                env_var: "API_KEY".to_string(),
                label: String::new(),
                required: true,
                secret: true,
            }],
            services: vec![ServiceSpec {
                name: "dashboard".to_string(),
                description: String::new(),
                url: "https://dash${BASE_DOMAIN}".to_string(),
                path: Some("/dash".to_string()),
                upstream: Some("127.0.0.1:3001".to_string()),
                lookup: None,
            }],
        }
    }

    #[test]
    fn test_validate_accepts_sample() {
        let set = ProfileSet {
            meta: ProfileMeta::default(),
            profiles: vec![sample_profile()],
        };
        set.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_placeholder() {
        let mut profile = sample_profile();
        profile.services[0].url = "https://x${PUBLIC_DNS}".to_string();
        let set = ProfileSet {
            meta: ProfileMeta::default(),
            profiles: vec![profile],
        };
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_routed_service_without_backend() {
        let mut profile = sample_profile();
        profile.services[0].upstream = None;
        let set = ProfileSet {
            meta: ProfileMeta::default(),
            profiles: vec![profile],
        };
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_active_selection() {
        let set = ProfileSet {
            meta: ProfileMeta::default(),
            profiles: vec![sample_profile()],
        };
        assert_eq!(set.active(None).unwrap().id, "compose");
        assert_eq!(set.active(Some("compose")).unwrap().id, "compose");
        assert!(matches!(
            set.active(Some("missing")),
            Err(LauncherError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_placeholder_scan() {
        assert_eq!(
            placeholders("https://a${HOST_IP}:1${BASE_DOMAIN}"),
            vec!["HOST_IP".to_string(), "BASE_DOMAIN".to_string()]
        );
        assert!(placeholders("plain").is_empty());
    }
}
