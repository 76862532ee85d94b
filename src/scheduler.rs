//! Keyed timers shared by hydration backfill and cache write coalescing.
//!
//! A [`Debouncer`] runs a future after a delay, tracked under a string key so
//! it can be cancelled individually, by prefix, or all at once. The entry is
//! held until the future finishes, so a key is "scheduled" for the whole
//! wait-and-run window.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, (u64, AbortHandle)>,
    next_token: u64,
}

#[derive(Clone, Default)]
pub struct Debouncer {
    registry: Arc<Mutex<Registry>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trailing-edge debounce: any task already waiting under `key` is
    /// cancelled and the timer restarts.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(key.into(), delay, task, true);
    }

    /// Schedule only when nothing is waiting or running under `key`.
    /// Returns `false` when the request was ignored.
    pub fn schedule_once<F>(&self, key: impl Into<String>, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(key.into(), delay, task, false)
    }

    fn spawn<F>(&self, key: String, delay: Duration, task: F, replace: bool) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut registry = lock(&self.registry);
        if let Some((_, existing)) = registry.tasks.get(&key) {
            if !replace {
                return false;
            }
            existing.abort();
        }
        let token = registry.next_token;
        registry.next_token += 1;

        let shared = Arc::clone(&self.registry);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
            let mut registry = lock(&shared);
            if registry.tasks.get(&task_key).map(|(t, _)| *t) == Some(token) {
                registry.tasks.remove(&task_key);
            }
        });
        registry.tasks.insert(key, (token, handle.abort_handle()));
        true
    }

    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.registry).tasks.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_prefix(&self, prefix: &str) -> usize {
        let mut registry = lock(&self.registry);
        let keys: Vec<String> = registry
            .tasks
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            if let Some((_, handle)) = registry.tasks.remove(key) {
                handle.abort();
            }
        }
        keys.len()
    }

    pub fn cancel_all(&self) {
        let mut registry = lock(&self.registry);
        for (_, (_, handle)) in registry.tasks.drain() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        lock(&self.registry).tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
