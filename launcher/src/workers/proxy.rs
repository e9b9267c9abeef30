//! Reverse-proxy process supervisor
//!
//! Keeps the proxy engine running against the active configuration file,
//! restarting it with exponential backoff if it exits. Shutdown terminates
//! the engine politely and escalates after a bounded wait.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::deploy::executor::terminate;
use crate::proxy::control::ProxyController;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Proxy supervisor options
#[derive(Debug, Clone)]
pub struct Options {
    /// Restart backoff schedule
    pub cooldown: CooldownOptions,

    /// Runtime after which a restart counter resets
    pub stable_after: Duration,

    /// How long to wait for a polite exit during shutdown
    pub term_grace: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cooldown: CooldownOptions::default(),
            stable_after: Duration::from_secs(60),
            term_grace: Duration::from_secs(10),
        }
    }
}

/// Run the proxy supervisor
pub async fn run(
    options: &Options,
    controller: Arc<ProxyController>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    if !controller.options().enabled {
        info!("Proxy supervision disabled");
        return;
    }

    info!("Proxy supervisor starting...");
    let mut attempt: u32 = 0;

    loop {
        let started = tokio::time::Instant::now();
        let spawn = Command::new(&controller.options().engine_binary)
            .arg("-c")
            .arg(controller.conf_path())
            .args(["-g", "daemon off;"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawn {
            Ok(mut child) => {
                tokio::select! {
                    _ = &mut shutdown_signal => {
                        info!("Proxy supervisor shutting down...");
                        terminate(&mut child);
                        if tokio::time::timeout(options.term_grace, child.wait()).await.is_err() {
                            warn!("Proxy engine ignored termination, killing");
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                        }
                        return;
                    }
                    status = child.wait() => {
                        warn!("Proxy engine exited: {:?}", status.ok());
                    }
                }
            }
            Err(e) => {
                warn!("Failed to start proxy engine: {}", e);
            }
        }

        if started.elapsed() > options.stable_after {
            attempt = 0;
        } else {
            attempt = attempt.saturating_add(1);
        }

        let delay = calc_exp_backoff(&options.cooldown, attempt);
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Proxy supervisor shutting down...");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
