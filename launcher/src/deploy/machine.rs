//! Deployment lifecycle state machine
//!
//! Owns the single authoritative deployment record and the single-flight
//! gate. Phases advance only through [`MachineEvent`]s raised by executor
//! completion; every transition is persisted with an atomic replace so a
//! restarted process recovers the last known phase.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::warn;

use crate::discovery::ResolvedService;
use crate::errors::LauncherError;
use crate::filesys::file::File;

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Nothing deployed
    Idle,

    /// Deploy sequence in progress
    Deploying,

    /// Workload live
    Deployed,

    /// Deploy sequence failed or was cancelled
    Failed,

    /// Teardown sequence in progress
    Uninstalling,
}

impl Phase {
    /// Whether a mutating sequence is in flight
    pub fn is_busy(&self) -> bool {
        matches!(self, Phase::Deploying | Phase::Uninstalling)
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Idle
    }
}

/// Exit details recorded on failure or cancellation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Stable error kind tag, e.g. `CommandFailed` or `Cancelled`
    #[serde(default)]
    pub kind: String,

    /// Exit code of the failing command, absent for spawn errors and
    /// interruptions
    pub exit_code: Option<i32>,

    /// Human-readable failure summary
    pub message: String,

    /// Trailing output lines of the failing command
    #[serde(default)]
    pub tail: Vec<String>,
}

impl ExitInfo {
    /// Record an execution error, carrying its stable kind tag into the
    /// persisted state
    pub fn from_error(err: &LauncherError) -> Self {
        let (exit_code, tail) = match err {
            LauncherError::CommandFailed { exit_code, tail } => {
                (Some(*exit_code), tail.clone())
            }
            _ => (None, Vec::new()),
        };
        Self {
            kind: err.kind().to_string(),
            exit_code,
            message: err.to_string(),
            tail,
        }
    }
}

/// The single authoritative deployment record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_info: Option<ExitInfo>,

    /// Resolved service links, non-empty only while deployed
    #[serde(default)]
    pub service_links: Vec<ResolvedService>,

    /// Set when discovery or proxy activation failed after a deploy; the
    /// routing table then reflects an earlier state of the workload
    #[serde(default)]
    pub routes_stale: bool,
}

/// Transition trigger
#[derive(Debug)]
pub enum MachineEvent {
    /// Validation passed, the deploy sequence is starting
    DeployRequested {
        profile_id: String,
        version: Option<String>,
        run_id: String,
    },

    /// Deploy sequence completed with exit code zero
    DeploySucceeded { services: Vec<ResolvedService> },

    /// Deploy sequence failed, was cancelled, or could not spawn
    DeployFailed { exit: ExitInfo },

    /// Teardown sequence is starting
    UninstallRequested,

    /// Teardown and cleanup finished
    UninstallFinished,
}

/// The state machine
pub struct Machine {
    record: RwLock<DeploymentState>,
    state_file: Arc<File>,
    gate: Arc<Mutex<()>>,
}

impl Machine {
    /// Load the machine, recovering persisted state best-effort.
    ///
    /// An in-flight phase found on disk means the previous process died
    /// mid-sequence; it collapses to `Failed` rather than pretending the
    /// sequence is still running.
    pub async fn load(state_file: Arc<File>) -> Self {
        let mut record = if state_file.exists().await {
            match state_file.read_json::<DeploymentState>().await {
                Ok(record) => record,
                Err(e) => {
                    warn!("Ignoring unreadable state file: {}", e);
                    DeploymentState::default()
                }
            }
        } else {
            DeploymentState::default()
        };

        if record.phase.is_busy() {
            warn!(
                "Recovered state file with phase {:?}; marking as interrupted",
                record.phase
            );
            record.phase = Phase::Failed;
            record.finished_at = Some(Utc::now());
            record.exit_info = Some(ExitInfo {
                message: "interrupted by restart".to_string(),
                ..ExitInfo::from_error(&LauncherError::Cancelled)
            });
            if let Err(e) = state_file.write_json_atomic(&record).await {
                warn!("Failed to persist recovered state: {}", e);
            }
        }

        Self {
            record: RwLock::new(record),
            state_file,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Snapshot of the current record
    pub async fn snapshot(&self) -> DeploymentState {
        self.record.read().await.clone()
    }

    /// Current phase
    pub async fn phase(&self) -> Phase {
        self.record.read().await.phase
    }

    /// Claim the single-flight gate.
    ///
    /// The returned guard must be held for the whole transition-plus-
    /// execution window; while it lives every other claim fails with
    /// `AlreadyRunning`.
    pub fn try_claim(&self) -> Result<OwnedMutexGuard<()>, LauncherError> {
        self.gate
            .clone()
            .try_lock_owned()
            .map_err(|_| LauncherError::AlreadyRunning)
    }

    /// Process an event, persist the new record, and return it
    pub async fn apply(&self, event: MachineEvent) -> Result<DeploymentState, LauncherError> {
        let mut record = self.record.write().await;
        let next = transition(&record, event)?;

        // Idle is only reached by finishing an uninstall; the state file is
        // removed rather than rewritten so "nothing deployed" leaves no trace.
        if next.phase == Phase::Idle {
            self.state_file.delete().await?;
        } else {
            self.state_file.write_json_atomic(&next).await?;
        }

        *record = next.clone();
        Ok(next)
    }

    /// Flag or clear routing-table staleness without a phase transition
    pub async fn set_routes_stale(&self, stale: bool) -> Result<(), LauncherError> {
        let mut record = self.record.write().await;
        if record.routes_stale == stale {
            return Ok(());
        }
        record.routes_stale = stale;
        if record.phase != Phase::Idle {
            self.state_file.write_json_atomic(&*record).await?;
        }
        Ok(())
    }
}

fn transition(
    current: &DeploymentState,
    event: MachineEvent,
) -> Result<DeploymentState, LauncherError> {
    let next = match (current.phase, event) {
        (
            Phase::Idle | Phase::Deployed | Phase::Failed,
            MachineEvent::DeployRequested {
                profile_id,
                version,
                run_id,
            },
        ) => DeploymentState {
            phase: Phase::Deploying,
            profile_id: Some(profile_id),
            version,
            run_id: Some(run_id),
            started_at: Some(Utc::now()),
            finished_at: None,
            exit_info: None,
            service_links: Vec::new(),
            routes_stale: false,
        },

        (Phase::Deploying, MachineEvent::DeploySucceeded { services }) => DeploymentState {
            phase: Phase::Deployed,
            finished_at: Some(Utc::now()),
            exit_info: None,
            service_links: services,
            routes_stale: false,
            ..current.clone()
        },

        (Phase::Deploying, MachineEvent::DeployFailed { exit }) => DeploymentState {
            phase: Phase::Failed,
            finished_at: Some(Utc::now()),
            exit_info: Some(exit),
            service_links: Vec::new(),
            ..current.clone()
        },

        (Phase::Deployed | Phase::Failed, MachineEvent::UninstallRequested) => DeploymentState {
            phase: Phase::Uninstalling,
            started_at: Some(Utc::now()),
            finished_at: None,
            ..current.clone()
        },

        (Phase::Uninstalling, MachineEvent::UninstallFinished) => DeploymentState::default(),

        (phase, event) => {
            return Err(LauncherError::Internal(format!(
                "invalid transition: {:?} -> {:?}",
                phase, event
            )));
        }
    };

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy_requested() -> MachineEvent {
        MachineEvent::DeployRequested {
            profile_id: "compose".to_string(),
            version: Some("1.0".to_string()),
            run_id: "run-1".to_string(),
        }
    }

    #[test]
    fn test_transition_success_flow() {
        let state = DeploymentState::default();

        let state = transition(&state, deploy_requested()).unwrap();
        assert_eq!(state.phase, Phase::Deploying);
        assert_eq!(state.profile_id.as_deref(), Some("compose"));

        let state = transition(
            &state,
            MachineEvent::DeploySucceeded {
                services: vec![ResolvedService {
                    name: "dash".to_string(),
                    url: "https://dash.example.com".to_string(),
                    description: String::new(),
                }],
            },
        )
        .unwrap();
        assert_eq!(state.phase, Phase::Deployed);
        assert_eq!(state.service_links.len(), 1);

        let state = transition(&state, MachineEvent::UninstallRequested).unwrap();
        assert_eq!(state.phase, Phase::Uninstalling);

        let state = transition(&state, MachineEvent::UninstallFinished).unwrap();
        assert_eq!(state, DeploymentState::default());
    }

    #[test]
    fn test_transition_failure_records_exit() {
        let state = transition(&DeploymentState::default(), deploy_requested()).unwrap();
        let state = transition(
            &state,
            MachineEvent::DeployFailed {
                exit: ExitInfo::from_error(&LauncherError::CommandFailed {
                    exit_code: 1,
                    tail: vec!["boom".to_string()],
                }),
            },
        )
        .unwrap();

        assert_eq!(state.phase, Phase::Failed);
        let exit = state.exit_info.as_ref().unwrap();
        assert_eq!(exit.kind, "CommandFailed");
        assert_eq!(exit.exit_code, Some(1));
        assert_eq!(exit.tail, vec!["boom".to_string()]);
        assert!(state.service_links.is_empty());
    }

    #[test]
    fn test_invalid_transition() {
        let idle = DeploymentState::default();
        assert!(transition(&idle, MachineEvent::UninstallRequested).is_err());
        assert!(transition(
            &idle,
            MachineEvent::DeploySucceeded { services: vec![] }
        )
        .is_err());
    }
}
