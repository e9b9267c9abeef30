//! Launchpad - Entry Point
//!
//! A self-hosted deployment launcher: drives a containerized or
//! cluster-based workload through parameterized external commands, streams
//! the rollout live and routes user traffic to the deployed services
//! through a hot-reloaded reverse proxy.

use std::collections::HashMap;
use std::env;

use launchpad::app::options::AppOptions;
use launchpad::app::run::run;
use launchpad::logs::{init_logging, LogOptions};
use launchpad::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        println!("{}", serde_json::to_string_pretty(&version).unwrap());
        return;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: env::var("LAUNCHER_LOG_LEVEL")
            .ok()
            .and_then(|level| level.parse().ok())
            .unwrap_or_default(),
        json_format: matches!(
            env::var("LAUNCHER_LOG_JSON").as_deref(),
            Ok("true") | Ok("1") | Ok("yes")
        ),
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    // Run the launcher
    let mut options = AppOptions::from_env();
    if cli_args.contains_key("dry-run") {
        options.dry_run_override = true;
        options.show_dry_run = true;
    }

    info!("Running launchpad {} with options: {:?}", version.version, options);
    let result = run(options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the launcher: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
