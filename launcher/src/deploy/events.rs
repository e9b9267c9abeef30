//! Deployment event feed
//!
//! Every run publishes its output through an [`EventFeed`]: a replay buffer
//! plus a broadcast channel. Subscribers attaching mid-run first receive the
//! buffered history, then the live tail, so every viewer of the same run
//! sees the identical ordered sequence.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::deploy::machine::Phase;
use crate::discovery::ResolvedService;

/// One event on a deploy or uninstall stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployEvent {
    /// Run started
    Start { message: String },

    /// Logical section marker
    Section { message: String },

    /// The command about to run, rendered as a single line
    Command { message: String },

    /// Merged stdout/stderr line from the running command
    Output { message: String },

    Info { message: String },

    Warning { message: String },

    Error { message: String },

    /// A resolved service link
    Service {
        name: String,
        url: String,
        #[serde(default)]
        description: String,
    },

    /// Terminal event closing the stream
    Summary {
        phase: Phase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default)]
        services: Vec<ResolvedService>,
    },
}

impl DeployEvent {
    /// Whether this event ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployEvent::Summary { .. })
    }
}

/// Shared event feed for one run
pub struct EventFeed {
    tx: broadcast::Sender<DeployEvent>,
    history: std::sync::Mutex<Vec<DeployEvent>>,
}

impl EventFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            history: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Publish an event to the history buffer and all live subscribers
    pub fn publish(&self, event: DeployEvent) {
        let mut history = self.history.lock().unwrap();
        history.push(event.clone());
        // No live subscribers is fine; the history still records the run
        let _ = self.tx.send(event);
    }

    /// Attach a subscriber: buffered history plus a live receiver.
    ///
    /// The history lock is held across the subscribe call so no event can
    /// fall between the replayed prefix and the live tail.
    pub fn subscribe(&self) -> (Vec<DeployEvent>, broadcast::Receiver<DeployEvent>) {
        let history = self.history.lock().unwrap();
        let rx = self.tx.subscribe();
        (history.clone(), rx)
    }

    /// Whether the run this feed belongs to has ended
    pub fn finished(&self) -> bool {
        self.history
            .lock()
            .unwrap()
            .last()
            .map(DeployEvent::is_terminal)
            .unwrap_or(false)
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}
