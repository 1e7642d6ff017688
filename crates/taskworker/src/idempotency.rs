//! At-most-once bookkeeping
//!
//! The check runs in the worker before an activation reaches a child, so every
//! child of one worker shares the same record.

use crate::child::ChildOptions;
use crate::registry::TaskRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskworker_core::TaskActivation;
use tracing::warn;

/// Longest time an at-most-once key is remembered
pub const MAX_AT_MOST_ONCE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Key under which an at-most-once activation is recorded
pub fn at_most_once_key(namespace: &str, taskname: &str, task_id: &str) -> String {
    format!("tw:amo:{}:{}:{}", namespace, taskname, task_id)
}

/// How long the key of an activation with `deadline` is kept
pub fn at_most_once_ttl(deadline: Duration) -> Duration {
    deadline.saturating_mul(2).min(MAX_AT_MOST_ONCE_TTL)
}

/// Records which at-most-once activations have already started
pub trait AtMostOnceStore: Send + Sync {
    /// Record `key`. Returns `false` if it was already recorded and has not expired.
    fn add(&self, key: &str, ttl: Duration) -> bool;
}

/// Store with expiring entries, held by the worker process
#[derive(Debug, Default)]
pub struct MemoryAtMostOnceStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryAtMostOnceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AtMostOnceStore for MemoryAtMostOnceStore {
    fn add(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires| *expires > now);

        if entries.contains_key(key) {
            return false;
        }
        let ttl = ttl.min(MAX_AT_MOST_ONCE_TTL);
        let expires = now.checked_add(ttl).unwrap_or(now);
        entries.insert(key.to_string(), expires);
        true
    }
}

/// Decides whether an activation may be handed to a child
pub struct AtMostOnceGate {
    registry: Arc<TaskRegistry>,
    store: Arc<dyn AtMostOnceStore>,
    options: ChildOptions,
}

impl AtMostOnceGate {
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<dyn AtMostOnceStore>,
        options: ChildOptions,
    ) -> Self {
        Self {
            registry,
            store,
            options,
        }
    }

    /// Returns `false` for a repeat delivery of an at-most-once activation.
    /// Unknown and ordinary tasks always pass.
    pub fn admit(&self, activation: &TaskActivation) -> bool {
        let Some(task) = self.registry.lookup(&activation.namespace, &activation.taskname) else {
            return true;
        };
        if !task.is_at_most_once() {
            return true;
        }

        let key = at_most_once_key(&activation.namespace, &activation.taskname, &activation.id);
        let ttl = at_most_once_ttl(self.options.deadline_for(activation));
        if self.store.add(&key, ttl) {
            return true;
        }
        warn!(
            task_id = %activation.id,
            taskname = %activation.taskname,
            "At-most-once task already started, skipping"
        );
        false
    }
}
