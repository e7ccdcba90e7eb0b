//! Observable connection lifecycle of the broadcaster.
//!
//! ```text
//! Disconnected -> Connecting -> WaitingForAck -> Ready -> Stopping -> Terminated
//!                     ^                            |
//!                     +------ connection lost -----+
//! ```
//!
//! `WaitingForAck` covers the stretch between the broker accepting the
//! connection and acknowledging the topic subscription.

use std::{fmt, sync::Arc};

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    WaitingForAck,
    Ready,
    Stopping,
    Terminated,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::WaitingForAck => "waiting-for-ack",
            ConnectionState::Ready => "ready",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared handle that records state changes and lets others watch them.
#[derive(Debug, Clone)]
pub struct StateTracker {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    /// Records `state`; returns `false` when it was already current.
    pub fn set(&self, state: ConnectionState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });

        if changed {
            info!(state = %state, "connection state changed");
        }
        changed
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
