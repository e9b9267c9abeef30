//! Deployment orchestration
//!
//! Ties the state machine, secret materializer, executor, discovery and
//! proxy controller into the two lifecycle operations: deploy and
//! uninstall. Validation happens synchronously before any command runs;
//! the command sequence itself runs in a detached task that owns the
//! single-flight permit, so the caller's connection may drop without
//! affecting the run.

use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::deploy::command::{
    deploy_sequence, detect_compose_flavor, dry_run_report, normalize_compose, resolve_env,
    uninstall_sequence, DryRunReport, ResolvedEnv,
};
use crate::deploy::events::{DeployEvent, EventFeed};
use crate::deploy::executor::{
    run_sequence, stop_channel, ExecOptions, ExitOutcome, StopHandle, StopSignal,
};
use crate::deploy::machine::{DeploymentState, ExitInfo, Machine, MachineEvent, Phase};
use crate::discovery::{
    base_domain, build_route_table, public_address, resolve_links, DiscoveryOptions,
    ResolvedService,
};
use crate::errors::LauncherError;
use crate::profile::{CommandSpec, DeploymentProfile, ProfileSet};
use crate::proxy::control::ProxyController;
use crate::proxy::ProxyMode;
use crate::secrets::env_file::{credential_file, materialize, remove, validate_credentials};
use crate::secrets::CredentialSet;

/// A deploy request as submitted by the caller
#[derive(Debug, Default)]
pub struct DeployRequest {
    /// Explicit profile id; the configured active profile otherwise
    pub profile_id: Option<String>,

    /// Field id to secret value
    pub credentials: CredentialSet,

    /// Workload version override
    pub version: Option<String>,

    /// Preview only: resolve everything, execute nothing
    pub dry_run: bool,
}

/// What a deploy request produced
pub enum DeployOutcome {
    /// The resolved plan; no state was touched
    DryRun(Box<DryRunReport>),

    /// A run was started; subscribe through the handle
    Started(Arc<RunHandle>),
}

/// Handle to an in-progress or finished run
pub struct RunHandle {
    pub run_id: String,
    feed: Arc<EventFeed>,
    stop: StopHandle,
}

impl RunHandle {
    /// Attach a subscriber: the full history so far plus the live tail
    pub fn subscribe(&self) -> (Vec<DeployEvent>, broadcast::Receiver<DeployEvent>) {
        self.feed.subscribe()
    }

    /// Whether the run has published its terminal event
    pub fn finished(&self) -> bool {
        self.feed.finished()
    }

    /// Number of events published so far
    pub fn event_count(&self) -> usize {
        self.feed.subscribe().0.len()
    }

    /// Request cancellation of the running command sequence
    pub fn cancel(&self) {
        self.stop.stop();
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Profile forced active by the environment, overriding request ids
    pub active_profile: Option<String>,

    /// Global dry-run override: every deploy request becomes a preview
    pub dry_run_override: bool,

    pub exec: ExecOptions,
    pub discovery: DiscoveryOptions,
}

/// Drives the deployment/uninstall lifecycle
pub struct Orchestrator {
    options: OrchestratorOptions,
    profiles: Arc<ProfileSet>,
    machine: Arc<Machine>,
    proxy: Arc<ProxyController>,

    /// The current or most recent run; replaced at the start of each run
    /// so late subscribers can still replay a finished run's output
    current: std::sync::Mutex<Option<Arc<RunHandle>>>,
}

impl Orchestrator {
    pub fn new(
        options: OrchestratorOptions,
        profiles: Arc<ProfileSet>,
        machine: Arc<Machine>,
        proxy: Arc<ProxyController>,
    ) -> Self {
        Self {
            options,
            profiles,
            machine,
            proxy,
            current: std::sync::Mutex::new(None),
        }
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// The profile a request resolves to: the environment override wins,
    /// then the request's id, then the first declared profile.
    pub fn resolve_profile(
        &self,
        requested: Option<&str>,
    ) -> Result<&DeploymentProfile, LauncherError> {
        let id = self.options.active_profile.as_deref().or(requested);
        self.profiles.active(id)
    }

    /// The current or most recent run, if any
    pub fn current_run(&self) -> Option<Arc<RunHandle>> {
        self.current.lock().unwrap().clone()
    }

    /// Cancel the current run. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        match self.current_run() {
            Some(run) if !run.finished() => {
                run.cancel();
                true
            }
            _ => false,
        }
    }

    /// Validate and start a deploy, or produce the dry-run plan.
    ///
    /// All validation errors surface here, before any phase transition or
    /// file write. `host_header` is the inbound Host header, used after a
    /// successful run to derive the domain-suffix template variable.
    pub async fn start_deploy(
        self: &Arc<Self>,
        request: DeployRequest,
        host_header: Option<String>,
    ) -> Result<DeployOutcome, LauncherError> {
        let profile = self.resolve_profile(request.profile_id.as_deref())?.clone();
        let entries = validate_credentials(&profile, request.credentials)?;
        let env = resolve_env(&profile, entries, request.version.as_deref());

        if request.dry_run || self.options.dry_run_override {
            return Ok(DeployOutcome::DryRun(Box::new(dry_run_report(
                &profile, &env,
            ))));
        }

        // Single-flight: the permit lives inside the run task until the
        // sequence finishes or is cancelled.
        let permit = self.machine.try_claim()?;

        let run_id = Uuid::new_v4().to_string();
        self.machine
            .apply(MachineEvent::DeployRequested {
                profile_id: profile.id.clone(),
                version: env.version().map(str::to_string),
                run_id: run_id.clone(),
            })
            .await?;

        let (stop, stop_signal) = stop_channel();
        let handle = Arc::new(RunHandle {
            run_id: run_id.clone(),
            feed: Arc::new(EventFeed::new()),
            stop,
        });
        *self.current.lock().unwrap() = Some(handle.clone());

        let orchestrator = self.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let _permit = permit;
            orchestrator
                .run_deploy(profile, env, task_handle, stop_signal, host_header)
                .await;
        });

        info!("Deploy run {} started", run_id);
        Ok(DeployOutcome::Started(handle))
    }

    async fn run_deploy(
        self: Arc<Self>,
        profile: DeploymentProfile,
        env: ResolvedEnv,
        handle: Arc<RunHandle>,
        mut stop_signal: StopSignal,
        host_header: Option<String>,
    ) {
        let feed = handle.feed.clone();
        feed.publish(DeployEvent::Start {
            message: format!("Starting {} deployment...", profile.id),
        });

        feed.publish(DeployEvent::Section {
            message: "Environment Setup".to_string(),
        });
        let cred_file = credential_file(&profile);
        if let Err(e) = materialize(env.secret_entries(), &cred_file).await {
            error!("Failed to materialize credentials: {}", e);
            feed.publish(DeployEvent::Error {
                message: "Failed to write credential file".to_string(),
            });
            self.finish_failed(&feed, ExitInfo::from_error(&e)).await;
            return;
        }
        feed.publish(DeployEvent::Info {
            message: "Credentials persisted for the external tooling".to_string(),
        });

        let commands = normalized(&deploy_sequence(&profile)).await;
        let working_dir = std::path::Path::new(&profile.working_dir);
        let result = run_sequence(
            &self.options.exec,
            &commands,
            working_dir,
            &env.materialized(),
            &feed,
            &mut stop_signal,
            true,
        )
        .await;

        match result.outcome {
            ExitOutcome::Success => {
                let services = self.resolve_services(&profile, host_header.as_deref()).await;

                feed.publish(DeployEvent::Section {
                    message: "Deployment Complete".to_string(),
                });
                for service in &services {
                    feed.publish(DeployEvent::Service {
                        name: service.name.clone(),
                        url: service.url.clone(),
                        description: service.description.clone(),
                    });
                }

                match self
                    .machine
                    .apply(MachineEvent::DeploySucceeded {
                        services: services.clone(),
                    })
                    .await
                {
                    Ok(_) => {
                        feed.publish(DeployEvent::Summary {
                            phase: Phase::Deployed,
                            exit_code: None,
                            services,
                        });

                        // Route rebuild happens outside the deploy lock;
                        // its failure marks the table stale, never the run.
                        let orchestrator = self.clone();
                        let deployed_profile = profile.clone();
                        tokio::spawn(async move {
                            orchestrator.refresh_routes(&deployed_profile).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to record deployed state: {}", e);
                        feed.publish(DeployEvent::Error {
                            message: "Failed to persist deployment state".to_string(),
                        });
                        feed.publish(DeployEvent::Summary {
                            phase: Phase::Failed,
                            exit_code: None,
                            services: Vec::new(),
                        });
                    }
                }
            }
            ExitOutcome::Failed { exit_code } => {
                let err = LauncherError::CommandFailed {
                    exit_code,
                    tail: result.tail,
                };
                self.finish_failed(&feed, ExitInfo::from_error(&err)).await;
            }
            ExitOutcome::Cancelled => {
                feed.publish(DeployEvent::Warning {
                    message: "Deployment cancelled".to_string(),
                });
                self.finish_failed(
                    &feed,
                    ExitInfo {
                        tail: result.tail,
                        ..ExitInfo::from_error(&LauncherError::Cancelled)
                    },
                )
                .await;
            }
        }
    }

    async fn finish_failed(&self, feed: &EventFeed, exit: ExitInfo) {
        let exit_code = exit.exit_code;
        if let Err(e) = self
            .machine
            .apply(MachineEvent::DeployFailed { exit })
            .await
        {
            error!("Failed to record failed state: {}", e);
        }
        feed.publish(DeployEvent::Summary {
            phase: Phase::Failed,
            exit_code,
            services: Vec::new(),
        });
    }

    /// Resolve service links by substituting the two runtime variables.
    /// Either lookup failing leaves its placeholder in the link rather
    /// than failing the deploy.
    async fn resolve_services(
        &self,
        profile: &DeploymentProfile,
        host_header: Option<&str>,
    ) -> Vec<ResolvedService> {
        let host_ip = match public_address(&self.options.discovery).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!("Public address lookup failed: {}", e);
                None
            }
        };
        let domain = host_header.and_then(|host| base_domain(host, &profile.host_prefix));

        resolve_links(profile, host_ip.as_deref(), domain.as_deref())
    }

    /// Rebuild the route table and swing the proxy to post-deployment
    /// routing. Any failure leaves the last-known-good configuration live
    /// and flags the table stale.
    pub async fn refresh_routes(&self, profile: &DeploymentProfile) {
        let (table, degraded) = build_route_table(profile, &self.options.discovery).await;

        match self.proxy.activate(ProxyMode::Post, Some(table)).await {
            Ok(()) => {
                if degraded {
                    warn!("Route table active with degraded entries");
                }
                if let Err(e) = self.machine.set_routes_stale(degraded).await {
                    warn!("Failed to record route staleness: {}", e);
                }
            }
            Err(e) => {
                warn!("Proxy activation failed, keeping previous routing: {}", e);
                if let Err(e) = self.machine.set_routes_stale(true).await {
                    warn!("Failed to record route staleness: {}", e);
                }
            }
        }
    }

    /// Validate and start an uninstall.
    ///
    /// Teardown is best-effort cleanup: every command runs regardless of
    /// individual exit codes, then the credential and state files are
    /// removed and the proxy reverts to pre-deployment routing.
    pub async fn start_uninstall(self: &Arc<Self>) -> Result<Arc<RunHandle>, LauncherError> {
        let permit = self.machine.try_claim()?;

        let snapshot = self.machine.snapshot().await;
        if !matches!(snapshot.phase, Phase::Deployed | Phase::Failed) {
            return Err(LauncherError::NothingToUninstall);
        }

        let profile = self
            .resolve_profile(snapshot.profile_id.as_deref())?
            .clone();

        self.machine.apply(MachineEvent::UninstallRequested).await?;

        let (stop, stop_signal) = stop_channel();
        let handle = Arc::new(RunHandle {
            run_id: Uuid::new_v4().to_string(),
            feed: Arc::new(EventFeed::new()),
            stop,
        });
        *self.current.lock().unwrap() = Some(handle.clone());

        let orchestrator = self.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let _permit = permit;
            orchestrator
                .run_uninstall(profile, task_handle, stop_signal)
                .await;
        });

        info!("Uninstall started");
        Ok(handle)
    }

    async fn run_uninstall(
        self: Arc<Self>,
        profile: DeploymentProfile,
        handle: Arc<RunHandle>,
        mut stop_signal: StopSignal,
    ) {
        let feed = handle.feed.clone();
        feed.publish(DeployEvent::Start {
            message: "Starting uninstall...".to_string(),
        });

        let commands = normalized(&uninstall_sequence(&profile)).await;
        let working_dir = std::path::Path::new(&profile.working_dir);
        let result = run_sequence(
            &self.options.exec,
            &commands,
            working_dir,
            &[],
            &feed,
            &mut stop_signal,
            false,
        )
        .await;

        if result.outcome != ExitOutcome::Success {
            feed.publish(DeployEvent::Warning {
                message: "Some teardown commands failed; resources may still be removed"
                    .to_string(),
            });
        }

        feed.publish(DeployEvent::Section {
            message: "Cleanup".to_string(),
        });

        if let Err(e) = remove(&credential_file(&profile)).await {
            warn!("Failed to remove credential file: {}", e);
            feed.publish(DeployEvent::Warning {
                message: "Could not remove credential file".to_string(),
            });
        } else {
            feed.publish(DeployEvent::Info {
                message: "Credentials cleaned up".to_string(),
            });
        }

        if let Err(e) = self.machine.apply(MachineEvent::UninstallFinished).await {
            error!("Failed to clear deployment state: {}", e);
        }

        if let Err(e) = self.proxy.activate(ProxyMode::Pre, None).await {
            warn!("Failed to revert proxy to pre-deployment routing: {}", e);
        }

        feed.publish(DeployEvent::Summary {
            phase: Phase::Idle,
            exit_code: None,
            services: Vec::new(),
        });
        info!("Uninstall finished");
    }

    /// Lightweight runtime status for polling clients
    pub async fn status(&self) -> RunStatus {
        let snapshot = self.machine.snapshot().await;
        let run = self.current_run();
        RunStatus {
            running: snapshot.phase.is_busy(),
            phase: snapshot.phase,
            run_id: run.as_ref().map(|r| r.run_id.clone()),
            event_count: run.as_ref().map(|r| r.event_count()).unwrap_or(0),
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
        }
    }

    /// Snapshot of the authoritative deployment record
    pub async fn state(&self) -> DeploymentState {
        self.machine.snapshot().await
    }
}

/// Runtime status of the current or most recent run
#[derive(Debug, serde::Serialize)]
pub struct RunStatus {
    pub running: bool,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub event_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

async fn normalized(commands: &[CommandSpec]) -> Vec<CommandSpec> {
    let flavor = detect_compose_flavor().await;
    commands
        .iter()
        .map(|spec| normalize_compose(spec, flavor))
        .collect()
}

/// Convert a JSON credential map into the typed credential set
pub fn credentials_from_json(
    map: std::collections::HashMap<String, String>,
) -> CredentialSet {
    map.into_iter()
        .map(|(id, value)| (id, SecretString::from(value)))
        .collect()
}
