//! Routes file-tree events into the sync engine.
//!
//! Creations, deletions and renames are applied immediately. Modifications
//! are debounced per path: rapid successive saves of the same file collapse
//! into a single [`SyncEngine::update`] once the file has been quiet for the
//! debounce window. Only supported files are considered.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::debounce::Debouncer;
use crate::models::FileDescriptor;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    Created(FileDescriptor),
    Renamed {
        old_path: String,
        file: FileDescriptor,
    },
    Deleted(FileDescriptor),
    Modified(FileDescriptor),
}

pub struct EventListener {
    engine: Arc<SyncEngine>,
    debouncer: Debouncer,
}

impl EventListener {
    pub fn new(engine: Arc<SyncEngine>, debounce: Duration) -> Self {
        Self {
            engine,
            debouncer: Debouncer::new(debounce),
        }
    }

    /// Number of modifications waiting for their debounce window.
    pub fn pending_updates(&self) -> usize {
        self.debouncer.pending_count()
    }

    pub async fn handle(&self, event: VaultEvent) -> Result<()> {
        match event {
            VaultEvent::Created(file) if file.is_supported() => {
                self.engine.create(&file).await?;
            }
            VaultEvent::Deleted(file) if file.is_supported() => {
                self.debouncer.cancel(&file.path);
                self.engine.delete(&file).await?;
            }
            VaultEvent::Renamed { old_path, file } => {
                let was_supported = FileDescriptor::from_path(&old_path).is_supported();
                if was_supported {
                    self.debouncer.cancel(&old_path);
                    self.engine.move_file(&old_path, &file).await?;
                } else if file.is_supported() {
                    self.engine.create(&file).await?;
                }
            }
            VaultEvent::Modified(file) if file.is_supported() => {
                let engine = Arc::clone(&self.engine);
                let key = file.path.clone();
                self.debouncer.arm(&key, async move {
                    if let Err(e) = engine.update(&file).await {
                        error!(path = %file.path, "update failed: {:#}", e);
                        engine.status().failed(format!("update {}: {:#}", file.path, e));
                    }
                });
            }
            other => debug!(event = ?other, "ignoring unsupported file"),
        }
        Ok(())
    }

    /// Consume events until the channel closes. Failures are logged and
    /// reflected in the status indicator; they never stop the loop.
    pub async fn run(self, mut events: mpsc::Receiver<VaultEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                error!("event handling failed: {:#}", e);
                self.engine.status().failed(format!("{:#}", e));
            }
        }
    }
}
