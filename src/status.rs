//! Persistent sync status indicator.
//!
//! Holds the latest [`SyncStatus`] in a `tokio::sync::watch` channel so any
//! number of observers (the CLI, a status line) can read or await changes.

use std::fmt;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Syncing,
    Ok,
    Failed(String),
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Syncing => f.write_str("syncing"),
            SyncStatus::Ok => f.write_str("ok"),
            SyncStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusIndicator {
    tx: watch::Sender<SyncStatus>,
}

impl StatusIndicator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::Ok);
        Self { tx }
    }

    pub fn set(&self, status: SyncStatus) {
        self.tx.send_replace(status);
    }

    pub fn syncing(&self) {
        self.set(SyncStatus::Syncing);
    }

    pub fn ok(&self) {
        self.set(SyncStatus::Ok);
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.set(SyncStatus::Failed(reason.into()));
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusIndicator {
    fn default() -> Self {
        Self::new()
    }
}
