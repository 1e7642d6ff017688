//! Shared stop flag

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A one-way flag observed by worker threads. Once triggered it stays set.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal shutdown
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
