//! Per-key trailing debouncer.
//!
//! Owns a timer table mapping each key (a vault path) to its single pending
//! timer. Arming a key that already has a pending timer aborts the old one,
//! so only the most recent request for a key fires, once the key has been
//! quiet for the whole window.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

type Table = Arc<Mutex<HashMap<String, Pending>>>;

fn lock(table: &Mutex<HashMap<String, Pending>>) -> MutexGuard<'_, HashMap<String, Pending>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Debouncer {
    window: Duration,
    pending: Table,
    next_generation: AtomicU64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Run `work` after the window elapses, replacing any pending work for
    /// `key`. Work that already started is not interrupted.
    pub fn arm<F>(&self, key: &str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let table = self.pending.clone();
        let owned_key = key.to_string();
        let window = self.window;

        // Held across spawn + insert so the timer cannot observe the table
        // before its own entry is in it.
        let mut pending = lock(&self.pending);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut pending = lock(&table);
                match pending.get(&owned_key) {
                    Some(p) if p.generation == generation => {
                        pending.remove(&owned_key);
                    }
                    _ => return,
                }
            }
            work.await;
        });

        if let Some(old) = pending.insert(key.to_string(), Pending { generation, handle }) {
            old.handle.abort();
        }
    }

    /// Drop the pending work for `key`. Returns whether anything was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.pending).remove(key) {
            Some(old) => {
                old.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        for (_, pending) in lock(&self.pending).drain() {
            pending.handle.abort();
        }
    }
}
