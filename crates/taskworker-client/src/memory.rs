//! In-memory broker
//!
//! Serves activations from a local queue and records every status update.
//! Failures can be injected per method to exercise retry paths.

use crate::traits::{BrokerClient, RpcError, RpcResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use taskworker_core::{ActivationStatus, FetchNextTask, TaskActivation};
use tonic::Code;

/// A status update received by the in-memory broker
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub task_id: String,
    pub status: ActivationStatus,
    pub fetch_next: Option<FetchNextTask>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<TaskActivation>,
    updates: Vec<StatusUpdate>,
    get_failures: VecDeque<RpcError>,
    update_failures: VecDeque<RpcError>,
    get_calls: usize,
    update_calls: usize,
}

/// Broker that lives in the worker process
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an activation for delivery
    pub fn push(&self, activation: TaskActivation) {
        self.inner.lock().pending.push_back(activation);
    }

    /// Queue several activations
    pub fn extend(&self, activations: impl IntoIterator<Item = TaskActivation>) {
        self.inner.lock().pending.extend(activations);
    }

    /// Fail the next `times` `get_task` calls with `code`
    pub fn fail_get_task(&self, times: usize, code: Code) {
        let mut inner = self.inner.lock();
        for _ in 0..times {
            inner
                .get_failures
                .push_back(RpcError::new(code, "injected get_task failure"));
        }
    }

    /// Fail the next `times` `update_task` calls with `code`
    pub fn fail_update_task(&self, times: usize, code: Code) {
        let mut inner = self.inner.lock();
        for _ in 0..times {
            inner
                .update_failures
                .push_back(RpcError::new(code, "injected update_task failure"));
        }
    }

    /// Activations not yet delivered
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Every successful status update, in arrival order
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.inner.lock().updates.clone()
    }

    /// Status reported for `task_id`, if any
    pub fn status_of(&self, task_id: &str) -> Option<ActivationStatus> {
        self.inner
            .lock()
            .updates
            .iter()
            .rev()
            .find(|u| u.task_id == task_id)
            .map(|u| u.status)
    }

    /// Number of `get_task` calls, failed ones included
    pub fn get_calls(&self) -> usize {
        self.inner.lock().get_calls
    }

    /// Number of `update_task` calls, failed ones included
    pub fn update_calls(&self) -> usize {
        self.inner.lock().update_calls
    }

    fn take_pending(inner: &mut Inner, namespace: Option<&str>) -> Option<TaskActivation> {
        let position = match namespace {
            Some(ns) => inner.pending.iter().position(|a| a.namespace == ns)?,
            None => 0,
        };
        inner.pending.remove(position)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn get_task(&self, namespace: Option<&str>) -> RpcResult<Option<TaskActivation>> {
        let mut inner = self.inner.lock();
        inner.get_calls += 1;
        if let Some(err) = inner.get_failures.pop_front() {
            return Err(err);
        }
        Ok(Self::take_pending(&mut inner, namespace))
    }

    async fn update_task(
        &self,
        task_id: &str,
        status: ActivationStatus,
        fetch_next: Option<FetchNextTask>,
    ) -> RpcResult<Option<TaskActivation>> {
        let mut inner = self.inner.lock();
        inner.update_calls += 1;
        if let Some(err) = inner.update_failures.pop_front() {
            return Err(err);
        }
        if task_id.is_empty() {
            return Err(RpcError::invalid("task id is required"));
        }

        inner.updates.push(StatusUpdate {
            task_id: task_id.to_string(),
            status,
            fetch_next: fetch_next.clone(),
        });

        Ok(match fetch_next {
            Some(fetch) => Self::take_pending(&mut inner, fetch.namespace.as_deref()),
            None => None,
        })
    }
}
