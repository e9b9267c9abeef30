//! Deployment lifecycle integration tests
//!
//! Drives the orchestrator end-to-end against real child processes and
//! tempdir-backed storage, with the proxy engine disabled so no external
//! binary is required.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::broadcast;

use launchpad::deploy::events::DeployEvent;
use launchpad::deploy::executor::ExecOptions;
use launchpad::deploy::machine::{Machine, Phase};
use launchpad::deploy::orchestrator::{
    DeployOutcome, DeployRequest, Orchestrator, OrchestratorOptions,
};
use launchpad::discovery::DiscoveryOptions;
use launchpad::errors::LauncherError;
use launchpad::filesys::file::File;
use launchpad::profile::{
    CommandSpec, DeploymentProfile, InputFieldSpec, ProfileMeta, ProfileSet,
};
use launchpad::proxy::control::{ProxyController, ProxyOptions};
use launchpad::secrets::SECRET_MASK;
use launchpad::storage::layout::StorageLayout;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    machine: Arc<Machine>,
    state_file: Arc<File>,
    credential_path: std::path::PathBuf,
    _data_dir: tempfile::TempDir,
    _working_dir: tempfile::TempDir,
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new(["sh", "-c", script])
}

fn test_profile(working_dir: &str, command: CommandSpec) -> DeploymentProfile {
    DeploymentProfile {
        id: "workload".to_string(),
        description: String::new(),
        heading: String::new(),
        working_dir: working_dir.to_string(),
        host_prefix: "studio".to_string(),
        versions: vec!["1.0".to_string()],
        default_version: "1.0".to_string(),
        pre_commands: vec![sh("echo build")],
        command,
        uninstall_commands: vec![sh("echo teardown")],
        input_fields: vec![InputFieldSpec {
            id: "api_key".to_string(),
            env_var: "API_KEY".to_string(),
            label: String::new(),
            required: true,
            secret: true,
        }],
        services: vec![],
    }
}

async fn harness(command: CommandSpec) -> Harness {
    harness_with(command, false).await
}

async fn harness_with(command: CommandSpec, dry_run_override: bool) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    let working_dir = tempfile::tempdir().unwrap();
    let working_path = working_dir.path().to_str().unwrap().to_string();

    let profiles = Arc::new(ProfileSet {
        meta: ProfileMeta::default(),
        profiles: vec![test_profile(&working_path, command)],
    });

    let layout = StorageLayout::new(data_dir.path());
    layout.setup().await.unwrap();

    let state_file = Arc::new(layout.state_file());
    let machine = Arc::new(Machine::load(state_file.clone()).await);

    let proxy = Arc::new(ProxyController::new(
        ProxyOptions {
            enabled: false,
            ..Default::default()
        },
        &layout,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorOptions {
            active_profile: None,
            dry_run_override,
            exec: ExecOptions {
                command_timeout: Duration::from_secs(30),
                term_grace: Duration::from_secs(2),
            },
            // Point address resolution at a closed port so tests fail fast
            // instead of calling out to the network.
            discovery: DiscoveryOptions {
                address_endpoint: "http://127.0.0.1:1".to_string(),
                http_timeout: Duration::from_millis(200),
                probe_timeout: Duration::from_millis(200),
                lookup_timeout: Duration::from_secs(1),
                fallback_backend: "127.0.0.1:9999".to_string(),
            },
        },
        profiles,
        machine.clone(),
        proxy,
    ));

    Harness {
        orchestrator,
        machine,
        state_file,
        credential_path: working_dir.path().join(".env"),
        _data_dir: data_dir,
        _working_dir: working_dir,
    }
}

fn credentials(value: &str) -> std::collections::HashMap<String, SecretString> {
    [("api_key".to_string(), SecretString::from(value.to_string()))]
        .into_iter()
        .collect()
}

fn deploy_request(value: &str) -> DeployRequest {
    DeployRequest {
        profile_id: None,
        credentials: credentials(value),
        version: None,
        dry_run: false,
    }
}

/// Drain a run feed until its terminal summary event
async fn drain(
    history: Vec<DeployEvent>,
    mut rx: broadcast::Receiver<DeployEvent>,
) -> Vec<DeployEvent> {
    let mut events = history;
    while !events.last().map(DeployEvent::is_terminal).unwrap_or(false) {
        match tokio::time::timeout(Duration::from_secs(20), rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            _ => panic!("run never published a terminal event: {:?}", events),
        }
    }
    events
}

async fn run_to_completion(harness: &Harness, request: DeployRequest) -> Vec<DeployEvent> {
    match harness.orchestrator.start_deploy(request, None).await.unwrap() {
        DeployOutcome::Started(run) => {
            let (history, rx) = run.subscribe();
            drain(history, rx).await
        }
        DeployOutcome::DryRun(_) => panic!("expected a real run"),
    }
}

/// The terminal event lands just before the run task releases the
/// single-flight permit, so a follow-up uninstall may briefly race it.
async fn start_uninstall_eventually(
    harness: &Harness,
) -> Arc<launchpad::deploy::orchestrator::RunHandle> {
    for _ in 0..50 {
        match harness.orchestrator.start_uninstall().await {
            Ok(run) => return run,
            Err(LauncherError::AlreadyRunning) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    panic!("single-flight permit never released");
}

#[tokio::test]
async fn test_concurrent_deploys_single_flight() {
    let harness = harness(sh("sleep 2")).await;

    let attempts = futures::future::join_all((0..4).map(|_| {
        let orchestrator = harness.orchestrator.clone();
        async move { orchestrator.start_deploy(deploy_request("k"), None).await }
    }))
    .await;

    let mut started = Vec::new();
    let mut rejected = 0;
    for attempt in attempts {
        match attempt {
            Ok(DeployOutcome::Started(run)) => started.push(run),
            Ok(DeployOutcome::DryRun(_)) => panic!("unexpected dry run"),
            Err(LauncherError::AlreadyRunning) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(started.len(), 1);
    assert_eq!(rejected, 3);

    // Let the winner finish so the tempdirs can be dropped cleanly
    let (history, rx) = started[0].subscribe();
    drain(history, rx).await;
}

#[tokio::test]
async fn test_failed_command_records_exit_info() {
    let harness = harness(sh("echo about to fail; exit 1")).await;

    let events = run_to_completion(&harness, deploy_request("k")).await;
    match events.last().unwrap() {
        DeployEvent::Summary {
            phase, exit_code, services,
        } => {
            assert_eq!(*phase, Phase::Failed);
            assert_eq!(*exit_code, Some(1));
            assert!(services.is_empty());
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }

    let state = harness.machine.snapshot().await;
    assert_eq!(state.phase, Phase::Failed);
    let exit = state.exit_info.unwrap();
    assert_eq!(exit.kind, "CommandFailed");
    assert_eq!(exit.exit_code, Some(1));
    assert!(exit.tail.iter().any(|line| line.contains("about to fail")));
    assert!(state.service_links.is_empty());
}

#[tokio::test]
async fn test_dry_run_masks_credentials_and_skips_execution() {
    let harness = harness(sh("echo deploy")).await;

    let request = DeployRequest {
        dry_run: true,
        ..deploy_request("super-secret-token")
    };
    let report = match harness.orchestrator.start_deploy(request, None).await.unwrap() {
        DeployOutcome::DryRun(report) => report,
        DeployOutcome::Started(_) => panic!("dry run must not start a run"),
    };

    let payload = serde_json::to_string(&*report).unwrap();
    assert!(!payload.contains("super-secret-token"));
    assert_eq!(report.environment["API_KEY"], SECRET_MASK);
    assert_eq!(report.version, "1.0");
    assert_eq!(report.commands.len(), 2);

    // No phase transition and no files were touched
    assert_eq!(harness.machine.phase().await, Phase::Idle);
    assert!(!harness.state_file.exists().await);
    assert!(!harness.credential_path.exists());
}

#[tokio::test]
async fn test_global_dry_run_override_forces_preview() {
    let harness = harness_with(sh("echo deploy"), true).await;

    // The request does not ask for a dry run, the override turns it into one
    let outcome = harness
        .orchestrator
        .start_deploy(deploy_request("k"), None)
        .await
        .unwrap();
    assert!(matches!(outcome, DeployOutcome::DryRun(_)));
    assert_eq!(harness.machine.phase().await, Phase::Idle);
    assert!(!harness.credential_path.exists());
}

#[tokio::test]
async fn test_validation_rejects_unknown_and_missing_fields() {
    let harness = harness(sh("echo deploy")).await;

    let unknown = DeployRequest {
        credentials: [(
            "not_declared".to_string(),
            SecretString::from("x".to_string()),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    };
    assert!(matches!(
        harness.orchestrator.start_deploy(unknown, None).await,
        Err(LauncherError::UnknownField(_))
    ));

    let missing = DeployRequest::default();
    assert!(matches!(
        harness.orchestrator.start_deploy(missing, None).await,
        Err(LauncherError::MissingRequiredField(_))
    ));

    // Validation failures never move the machine
    assert_eq!(harness.machine.phase().await, Phase::Idle);
}

#[tokio::test]
async fn test_uninstall_resets_state_and_removes_files() {
    let harness = harness(sh("echo deploy")).await;

    run_to_completion(&harness, deploy_request("k")).await;
    assert_eq!(harness.machine.phase().await, Phase::Deployed);
    assert!(harness.state_file.exists().await);
    assert!(harness.credential_path.exists());

    let run = start_uninstall_eventually(&harness).await;
    let (history, rx) = run.subscribe();
    let events = drain(history, rx).await;

    match events.last().unwrap() {
        DeployEvent::Summary { phase, .. } => assert_eq!(*phase, Phase::Idle),
        other => panic!("unexpected terminal event: {:?}", other),
    }
    assert_eq!(harness.machine.phase().await, Phase::Idle);
    assert!(!harness.state_file.exists().await);
    assert!(!harness.credential_path.exists());
}

#[tokio::test]
async fn test_uninstall_from_idle_is_rejected() {
    let harness = harness(sh("echo deploy")).await;
    assert!(matches!(
        harness.orchestrator.start_uninstall().await,
        Err(LauncherError::NothingToUninstall)
    ));
}

#[tokio::test]
async fn test_uninstall_allowed_after_failure() {
    let harness = harness(sh("exit 1")).await;

    run_to_completion(&harness, deploy_request("k")).await;
    assert_eq!(harness.machine.phase().await, Phase::Failed);

    let run = start_uninstall_eventually(&harness).await;
    let (history, rx) = run.subscribe();
    drain(history, rx).await;
    assert_eq!(harness.machine.phase().await, Phase::Idle);
}

#[tokio::test]
async fn test_two_subscribers_see_identical_streams() {
    let harness = harness(sh("echo one; echo two; echo three")).await;

    let run = match harness
        .orchestrator
        .start_deploy(deploy_request("k"), None)
        .await
        .unwrap()
    {
        DeployOutcome::Started(run) => run,
        DeployOutcome::DryRun(_) => panic!("expected a real run"),
    };

    let (history_a, rx_a) = run.subscribe();
    let (history_b, rx_b) = run.subscribe();
    let events_a = drain(history_a, rx_a).await;
    let events_b = drain(history_b, rx_b).await;

    let lines = |events: &[DeployEvent]| -> Vec<String> {
        events
            .iter()
            .map(|event| serde_json::to_string(event).unwrap())
            .collect()
    };
    assert_eq!(lines(&events_a), lines(&events_b));

    // A subscriber attaching after the run finished replays the same view
    let (history_late, rx_late) = run.subscribe();
    let events_late = drain(history_late, rx_late).await;
    assert_eq!(lines(&events_a), lines(&events_late));
}

#[tokio::test]
async fn test_cancel_yields_cancelled_not_failed() {
    let harness = harness(sh("sleep 30")).await;

    let run = match harness
        .orchestrator
        .start_deploy(deploy_request("k"), None)
        .await
        .unwrap()
    {
        DeployOutcome::Started(run) => run,
        DeployOutcome::DryRun(_) => panic!("expected a real run"),
    };

    // Give the child a moment to spawn, then stop it
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.orchestrator.cancel());

    let (history, rx) = run.subscribe();
    let events = drain(history, rx).await;
    match events.last().unwrap() {
        DeployEvent::Summary { phase, exit_code, .. } => {
            assert_eq!(*phase, Phase::Failed);
            assert_eq!(*exit_code, None);
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }

    let exit = harness.machine.snapshot().await.exit_info.unwrap();
    assert_eq!(exit.kind, "Cancelled");
    assert!(exit.message.contains("cancelled"));
}

#[tokio::test]
async fn test_restart_collapses_inflight_phase_to_failed() {
    let harness = harness(sh("echo deploy")).await;

    // Simulate a crash mid-deploy: a persisted Deploying record
    let interrupted = launchpad::deploy::machine::DeploymentState {
        phase: Phase::Deploying,
        profile_id: Some("workload".to_string()),
        ..Default::default()
    };
    harness
        .state_file
        .write_json_atomic(&interrupted)
        .await
        .unwrap();

    let recovered = Machine::load(harness.state_file.clone()).await;
    let state = recovered.snapshot().await;
    assert_eq!(state.phase, Phase::Failed);
    assert!(state.exit_info.unwrap().message.contains("interrupted"));
}
