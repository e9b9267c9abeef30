//! Streaming command executor
//!
//! Runs an ordered command sequence, merging each child's stdout and stderr
//! into line events on the run's feed. Cancellation is cooperative: the
//! child first receives a polite termination signal and is killed outright
//! only after a bounded grace period. The executor always drives a command
//! to completion even when nobody is subscribed to the feed.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::deploy::events::{DeployEvent, EventFeed};
use crate::profile::CommandSpec;

/// Number of trailing output lines kept for failure reports
pub const TAIL_LINES: usize = 20;

/// Executor options
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Overall timeout applied to each command
    pub command_timeout: Duration,

    /// Grace period between the polite stop signal and a forced kill
    pub term_grace: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(900), // 15 minutes
            term_grace: Duration::from_secs(10),
        }
    }
}

/// Outcome of a command or a sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failed { exit_code: i32 },
    Cancelled,
}

/// Result of a command sequence
#[derive(Debug, Clone)]
pub struct ExitResult {
    pub outcome: ExitOutcome,

    /// Trailing output lines of the command the result belongs to
    pub tail: Vec<String>,
}

impl ExitResult {
    fn success() -> Self {
        Self {
            outcome: ExitOutcome::Success,
            tail: Vec::new(),
        }
    }
}

/// Create a stop handle/signal pair for one run
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

/// Caller-side cancellation handle
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Executor-side cancellation signal
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop is requested. A dropped handle means the run can
    /// never be cancelled, not that it was.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run a command sequence strictly in order, streaming merged output.
///
/// With `stop_on_error` set, the first non-zero exit skips the remaining
/// commands and the sequence result carries that command's exit code and
/// output tail (deploy semantics). Teardown sequences pass `false` and run
/// every command regardless of individual failures.
pub async fn run_sequence(
    options: &ExecOptions,
    commands: &[CommandSpec],
    working_dir: &Path,
    env: &[(String, String)],
    feed: &EventFeed,
    stop: &mut StopSignal,
    stop_on_error: bool,
) -> ExitResult {
    let total = commands.len();
    let mut first_failure: Option<ExitResult> = None;

    for (idx, command) in commands.iter().enumerate() {
        if stop.is_stopped() {
            return ExitResult {
                outcome: ExitOutcome::Cancelled,
                tail: Vec::new(),
            };
        }

        feed.publish(DeployEvent::Section {
            message: format!("Command {}/{}", idx + 1, total),
        });
        feed.publish(DeployEvent::Command {
            message: command.display(),
        });

        let result = run_command(options, command, working_dir, env, feed, stop).await;
        match result.outcome {
            ExitOutcome::Success => {}
            ExitOutcome::Cancelled => return result,
            ExitOutcome::Failed { exit_code } => {
                feed.publish(DeployEvent::Error {
                    message: format!("Command failed with exit code {}", exit_code),
                });
                if stop_on_error {
                    return result;
                }
                if first_failure.is_none() {
                    first_failure = Some(result);
                }
            }
        }
    }

    first_failure.unwrap_or_else(ExitResult::success)
}

async fn run_command(
    options: &ExecOptions,
    command: &CommandSpec,
    working_dir: &Path,
    env: &[(String, String)],
    feed: &EventFeed,
    stop: &mut StopSignal,
) -> ExitResult {
    debug!("Executing: {}", command.display());

    let mut child = match Command::new(command.program())
        .args(command.args())
        .current_dir(working_dir)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let message = format!("Failed to start {}: {}", command.program(), e);
            feed.publish(DeployEvent::Error {
                message: message.clone(),
            });
            return ExitResult {
                outcome: ExitOutcome::Failed { exit_code: 127 },
                tail: vec![message],
            };
        }
    };

    // Pump both pipes into one line channel; interleaving follows arrival
    // order across the two streams.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    let mut cancelled = false;
    let mut termed = false;
    let mut killed = false;

    let timeout = tokio::time::sleep(options.command_timeout);
    tokio::pin!(timeout);
    // Escalation deadline; armed when the child is asked to stop
    let escalate = tokio::time::sleep(Duration::from_secs(86_400 * 365));
    tokio::pin!(escalate);

    loop {
        tokio::select! {
            maybe_line = line_rx.recv() => match maybe_line {
                Some(line) => {
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                    feed.publish(DeployEvent::Output { message: line });
                }
                // Both pipes closed; the child has exited or lost them
                None => break,
            },

            _ = stop.stopped(), if !termed => {
                info!("Stop requested, terminating child process");
                feed.publish(DeployEvent::Info {
                    message: "Stop requested, terminating...".to_string(),
                });
                cancelled = true;
                termed = true;
                terminate(&mut child);
                escalate.as_mut().reset(tokio::time::Instant::now() + options.term_grace);
            }

            _ = &mut timeout, if !termed => {
                warn!("Command timed out after {:?}", options.command_timeout);
                feed.publish(DeployEvent::Warning {
                    message: "Command timed out, terminating...".to_string(),
                });
                cancelled = true;
                termed = true;
                terminate(&mut child);
                escalate.as_mut().reset(tokio::time::Instant::now() + options.term_grace);
            }

            _ = &mut escalate, if termed => {
                if killed {
                    // Pipes held open past the kill, e.g. by an orphaned
                    // grandchild; stop reading and reap what we can.
                    warn!("Output pipes still open after kill, abandoning stream");
                    break;
                }
                warn!("Grace period elapsed, killing child process");
                let _ = child.start_kill();
                killed = true;
                escalate.as_mut().reset(tokio::time::Instant::now() + options.term_grace);
            }
        }
    }

    let status = match tokio::time::timeout(options.term_grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!("Failed to reap child process: {}", e);
            None
        }
        Err(_) => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };

    let tail: Vec<String> = tail.into_iter().collect();

    if cancelled {
        return ExitResult {
            outcome: ExitOutcome::Cancelled,
            tail,
        };
    }

    match status {
        Some(status) if status.success() => ExitResult {
            outcome: ExitOutcome::Success,
            tail,
        },
        Some(status) => ExitResult {
            outcome: ExitOutcome::Failed {
                exit_code: status.code().unwrap_or(-1),
            },
            tail,
        },
        None => ExitResult {
            outcome: ExitOutcome::Failed { exit_code: -1 },
            tail,
        },
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Ask the child to exit politely; escalation happens via the caller's
/// grace deadline.
pub(crate) fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }
    }
    let _ = child.start_kill();
}
