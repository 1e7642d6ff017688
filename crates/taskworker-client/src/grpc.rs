//! gRPC broker client
//!
//! Talks to one or more broker replicas. Fetches go to the currently selected
//! broker, which is replaced at random after a number of fetched tasks or after
//! repeated `Unavailable` errors. Status updates go back to the broker that
//! delivered the activation.

use crate::convert::status_to_proto;
use crate::generated::taskbroker::v1::{
    self as proto, consumer_service_client::ConsumerServiceClient,
};
use crate::traits::{BrokerClient, RpcError, RpcResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use taskworker_core::{ActivationStatus, BrokerConfig, FetchNextTask, TaskActivation};
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

/// Deliveries remembered for update routing, at most
const MAX_TRACKED_DELIVERIES: usize = 100_000;

/// How often expired deliveries are swept
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Routing bookkeeping shared by all calls
#[derive(Debug, Default)]
struct RoutingState {
    /// Index of the broker serving fetches
    current: usize,
    /// Tasks fetched from `current` since it was selected
    fetched: u64,
    /// Consecutive `Unavailable` errors from `current`
    unavailable: u32,
    /// Activation id -> broker that delivered it, and when.
    /// Activations that never get an update expire after the retention.
    task_hosts: HashMap<String, (usize, Instant)>,
    /// Last sweep of `task_hosts`
    last_prune: Option<Instant>,
}

/// Broker client over gRPC
pub struct GrpcBrokerClient {
    hosts: Vec<String>,
    clients: Vec<ConsumerServiceClient<Channel>>,
    state: Mutex<RoutingState>,
    max_tasks_before_rebalance: u64,
    max_consecutive_unavailable: u32,
    delivery_retention: Duration,
}

impl GrpcBrokerClient {
    /// Build a client for every configured broker.
    ///
    /// Channels connect lazily, so this must run inside a tokio runtime context
    /// but does not wait for the brokers to be reachable.
    pub fn new(config: &BrokerConfig) -> RpcResult<Self> {
        let hosts = config.broker_hosts();
        let connect_timeout = Duration::from_secs(config.connect_timeout);
        let request_timeout = Duration::from_secs(config.request_timeout);

        let clients = hosts
            .iter()
            .map(|host| {
                let uri = if host.contains("://") {
                    host.clone()
                } else {
                    format!("http://{}", host)
                };
                let endpoint = Endpoint::from_shared(uri)
                    .map_err(|e| RpcError::invalid(format!("Invalid broker address '{}': {}", host, e)))?
                    .connect_timeout(connect_timeout)
                    .timeout(request_timeout);
                Ok(ConsumerServiceClient::new(endpoint.connect_lazy()))
            })
            .collect::<RpcResult<Vec<_>>>()?;

        let current = rand::thread_rng().gen_range(0..hosts.len());
        info!(hosts = ?hosts, selected = %hosts[current], "Broker client configured");

        Ok(Self {
            hosts,
            clients,
            state: Mutex::new(RoutingState {
                current,
                ..Default::default()
            }),
            max_tasks_before_rebalance: config.max_tasks_before_rebalance,
            max_consecutive_unavailable: config.max_consecutive_unavailable.max(1),
            delivery_retention: Duration::from_secs(config.delivery_retention),
        })
    }

    /// Broker addresses this client may talk to
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Address of the broker currently serving fetches
    pub fn current_host(&self) -> &str {
        &self.hosts[self.state.lock().current]
    }

    fn rotate(&self, state: &mut RoutingState) {
        if self.hosts.len() > 1 {
            // pick any broker other than the current one
            let offset = rand::thread_rng().gen_range(1..self.hosts.len());
            state.current = (state.current + offset) % self.hosts.len();
        }
        state.fetched = 0;
        state.unavailable = 0;
        debug!(host = %self.hosts[state.current], "Switched broker");
    }

    /// Record a delivered activation against the broker that sent it
    fn record_delivery(&self, host: usize, activation: &TaskActivation) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let sweep_due = state
            .last_prune
            .map_or(true, |at| now.saturating_duration_since(at) >= PRUNE_INTERVAL);
        if sweep_due || state.task_hosts.len() >= MAX_TRACKED_DELIVERIES {
            self.prune_deliveries(&mut state, now);
        }
        state.task_hosts.insert(activation.id.clone(), (host, now));
        if host == state.current {
            state.fetched += 1;
            if self.max_tasks_before_rebalance > 0 && state.fetched >= self.max_tasks_before_rebalance {
                self.rotate(&mut state);
            }
        }
    }

    /// Forget deliveries older than the retention, then the oldest ones past the cap
    fn prune_deliveries(&self, state: &mut RoutingState, now: Instant) {
        let retention = self.delivery_retention;
        let before = state.task_hosts.len();
        state
            .task_hosts
            .retain(|_, (_, delivered)| now.saturating_duration_since(*delivered) < retention);

        while state.task_hosts.len() >= MAX_TRACKED_DELIVERIES {
            let oldest = state
                .task_hosts
                .iter()
                .min_by_key(|(_, (_, delivered))| *delivered)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => state.task_hosts.remove(&id),
                None => break,
            };
        }

        state.last_prune = Some(now);
        let dropped = before - state.task_hosts.len();
        if dropped > 0 {
            debug!(dropped, "Forgot deliveries that never got a status update");
        }
    }

    fn record_outcome(&self, host: usize, result: &Result<(), &RpcError>) {
        let mut state = self.state.lock();
        if host != state.current {
            return;
        }
        match result {
            Ok(()) => state.unavailable = 0,
            Err(err) if err.code == Code::Unavailable => {
                state.unavailable += 1;
                if state.unavailable >= self.max_consecutive_unavailable {
                    warn!(
                        host = %self.hosts[host],
                        errors = state.unavailable,
                        "Broker unavailable, rotating"
                    );
                    self.rotate(&mut state);
                }
            }
            Err(_) => {}
        }
    }
}

#[async_trait]
impl BrokerClient for GrpcBrokerClient {
    async fn get_task(&self, namespace: Option<&str>) -> RpcResult<Option<TaskActivation>> {
        let host = self.state.lock().current;
        let mut client = self.clients[host].clone();

        let request = proto::GetTaskRequest {
            namespace: namespace.map(str::to_string),
        };

        let response = client.get_task(request).await;
        match response {
            Ok(response) => {
                self.record_outcome(host, &Ok(()));
                let activation: Option<TaskActivation> =
                    response.into_inner().task.map(Into::into);
                if let Some(ref activation) = activation {
                    self.record_delivery(host, activation);
                }
                Ok(activation)
            }
            Err(status) if status.code() == Code::NotFound => {
                self.record_outcome(host, &Ok(()));
                Ok(None)
            }
            Err(status) => {
                let err = RpcError::from(status);
                self.record_outcome(host, &Err(&err));
                Err(err)
            }
        }
    }

    async fn update_task(
        &self,
        task_id: &str,
        status: ActivationStatus,
        fetch_next: Option<FetchNextTask>,
    ) -> RpcResult<Option<TaskActivation>> {
        let host = {
            let state = self.state.lock();
            state
                .task_hosts
                .get(task_id)
                .map(|(host, _)| *host)
                .unwrap_or(state.current)
        };
        let mut client = self.clients[host].clone();

        let request = proto::SetTaskStatusRequest {
            id: task_id.to_string(),
            status: status_to_proto(status) as i32,
            fetch_next_task: fetch_next.map(Into::into),
        };

        match client.set_task_status(request).await {
            Ok(response) => {
                self.state.lock().task_hosts.remove(task_id);
                self.record_outcome(host, &Ok(()));
                let next: Option<TaskActivation> = response.into_inner().task.map(Into::into);
                if let Some(ref next) = next {
                    self.record_delivery(host, next);
                }
                Ok(next)
            }
            Err(status) => {
                let err = RpcError::from(status);
                if !err.is_transient() {
                    // the result will not be retried
                    self.state.lock().task_hosts.remove(task_id);
                }
                self.record_outcome(host, &Err(&err));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(num_brokers: Option<usize>) -> BrokerConfig {
        BrokerConfig {
            rpc_host: "taskbroker:50051".to_string(),
            num_brokers,
            max_tasks_before_rebalance: 2,
            max_consecutive_unavailable: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_hosts_from_config() {
        let client = GrpcBrokerClient::new(&config(Some(3))).unwrap();
        assert_eq!(client.hosts().len(), 3);
        assert!(client.hosts().iter().any(|h| h == client.current_host()));

        let single = GrpcBrokerClient::new(&config(None)).unwrap();
        assert_eq!(single.hosts(), &["taskbroker:50051".to_string()]);
    }

    #[tokio::test]
    async fn test_rebalance_after_fetched_tasks() {
        let client = GrpcBrokerClient::new(&config(Some(2))).unwrap();
        let first = client.state.lock().current;

        client.record_delivery(first, &TaskActivation::new("a", "ns", "t"));
        assert_eq!(client.state.lock().current, first);
        client.record_delivery(first, &TaskActivation::new("b", "ns", "t"));
        assert_ne!(client.state.lock().current, first);

        // updates still route to the delivering broker
        assert_eq!(client.state.lock().task_hosts.get("a").map(|(h, _)| *h), Some(first));
    }

    #[tokio::test]
    async fn test_unreported_deliveries_expire() {
        let mut config = config(Some(2));
        config.delivery_retention = 30;
        let client = GrpcBrokerClient::new(&config).unwrap();
        let host = client.state.lock().current;

        client.record_delivery(host, &TaskActivation::new("skipped", "ns", "t"));
        client.record_delivery(host, &TaskActivation::new("fresh", "ns", "t"));
        assert_eq!(client.state.lock().task_hosts.len(), 2);

        {
            let mut state = client.state.lock();
            let later = Instant::now() + Duration::from_secs(10);
            client.prune_deliveries(&mut state, later);
            assert_eq!(state.task_hosts.len(), 2);

            // only the delivery nobody reported on is old enough to go
            state.task_hosts.get_mut("fresh").unwrap().1 = later;
            client.prune_deliveries(&mut state, later + Duration::from_secs(25));
            assert!(!state.task_hosts.contains_key("skipped"));
            assert!(state.task_hosts.contains_key("fresh"));
        }
    }

    #[tokio::test]
    async fn test_rotate_after_unavailable() {
        let client = GrpcBrokerClient::new(&config(Some(2))).unwrap();
        let first = client.state.lock().current;
        let err = RpcError::unavailable("down");

        client.record_outcome(first, &Err(&err));
        assert_eq!(client.state.lock().current, first);
        client.record_outcome(first, &Err(&err));
        assert_ne!(client.state.lock().current, first);
    }
}
