//! File-system watcher for the vault tree.
//!
//! Wraps a `notify` watcher and converts its raw events into
//! [`VaultEvent`]s with vault-relative paths, dropping anything under an
//! excluded glob. Events are pushed onto a tokio channel for the
//! [`EventListener`](crate::listener::EventListener); modifications are not
//! coalesced here, the listener debounces them per path.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::GlobSet;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::VaultConfig;
use crate::listener::VaultEvent;
use crate::models::FileDescriptor;
use crate::vault;

/// Keeps the underlying watcher alive. Dropping it stops the feed and
/// closes the channel.
pub struct VaultWatcher {
    _watcher: RecommendedWatcher,
}

impl VaultWatcher {
    pub fn start(config: &VaultConfig, events: mpsc::Sender<VaultEvent>) -> Result<Self> {
        let root = config
            .root
            .canonicalize()
            .with_context(|| format!("Vault root does not exist: {}", config.root.display()))?;
        let excludes = vault::exclude_set(config)?;

        let handler_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for vault_event in convert_event(&handler_root, &excludes, &event) {
                        // The notify thread is outside the runtime.
                        if events.blocking_send(vault_event).is_err() {
                            warn!("event channel closed");
                            return;
                        }
                    }
                }
                Err(e) => error!("watch error: {}", e),
            }
        })
        .context("failed to create file watcher")?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;
        debug!(root = %root.display(), "watching vault");

        Ok(Self { _watcher: watcher })
    }
}

/// Vault-relative `/`-separated path, or `None` when outside the root or
/// excluded.
fn relative(root: &Path, excludes: &GlobSet, path: &Path) -> Option<String> {
    let rel = path
        .strip_prefix(root)
        .ok()?
        .to_string_lossy()
        .replace('\\', "/");
    if rel.is_empty() || excludes.is_match(&rel) {
        return None;
    }
    Some(rel)
}

fn convert_event(root: &Path, excludes: &GlobSet, event: &Event) -> Vec<VaultEvent> {
    let paths: Vec<Option<String>> = event
        .paths
        .iter()
        .map(|p| relative(root, excludes, p))
        .collect();
    let first = || paths.first().cloned().flatten().map(|p| FileDescriptor::from_path(&p));

    match &event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => first().map(VaultEvent::Created).into_iter().collect(),
        EventKind::Remove(_) => first().map(VaultEvent::Deleted).into_iter().collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.as_slice() {
            [Some(old_path), Some(new_path)] => vec![VaultEvent::Renamed {
                old_path: old_path.clone(),
                file: FileDescriptor::from_path(new_path),
            }],
            [Some(old_path), None] => vec![VaultEvent::Deleted(FileDescriptor::from_path(old_path))],
            [None, Some(new_path)] => vec![VaultEvent::Created(FileDescriptor::from_path(new_path))],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            first().map(VaultEvent::Deleted).into_iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            first().map(VaultEvent::Created).into_iter().collect()
        }
        // Single-path renames (e.g. FSEvents): decide by whether the path is still there.
        EventKind::Modify(ModifyKind::Name(_)) => {
            let exists = event.paths.first().map(PathBuf::as_path).is_some_and(Path::exists);
            let file = first();
            if exists {
                file.map(VaultEvent::Created).into_iter().collect()
            } else {
                file.map(VaultEvent::Deleted).into_iter().collect()
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => first().map(VaultEvent::Modified).into_iter().collect(),
        _ => Vec::new(),
    }
}
