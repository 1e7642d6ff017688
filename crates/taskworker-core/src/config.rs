//! Configuration structures for the taskworker

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a taskworker process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskWorkerConfig {
    /// Broker connection
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Worker pool and scheduling
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TaskWorkerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::Error::Configuration(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Merge configuration from file and environment; env vars take precedence
    pub fn load(path: Option<impl AsRef<Path>>) -> crate::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> crate::Result<()> {
        if let Some(host) = env_var("TASKWORKER_RPC_HOST") {
            self.broker.rpc_host = host;
        }
        if let Some(num) = env_parse::<usize>("TASKWORKER_NUM_BROKERS")? {
            self.broker.num_brokers = Some(num);
        }
        if let Some(namespace) = env_var("TASKWORKER_NAMESPACE") {
            self.broker.namespace = Some(namespace);
        }
        if let Some(concurrency) = env_parse::<usize>("TASKWORKER_CONCURRENCY")? {
            self.worker.concurrency = concurrency;
        }
        if let Some(max) = env_parse::<u64>("TASKWORKER_MAX_CHILD_TASK_COUNT")? {
            self.worker.max_child_task_count = Some(max);
        }
        if let Some(process_type) = env_var("TASKWORKER_PROCESS_TYPE") {
            self.worker.process_type = process_type
                .parse()
                .map_err(crate::Error::Configuration)?;
        }
        if let Some(secs) = env_parse::<u64>("TASKWORKER_PROCESSING_DEADLINE_OVERRIDE")? {
            self.worker.processing_deadline_override = Some(secs);
        }
        if let Some(level) = env_var("TASKWORKER_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.broker.rpc_host.trim().is_empty() {
            return Err(crate::Error::Configuration("rpc_host must not be empty".into()));
        }
        if self.broker.num_brokers == Some(0) {
            return Err(crate::Error::Configuration("num_brokers must be at least 1".into()));
        }
        if self.worker.max_child_task_count == Some(0) {
            return Err(crate::Error::Configuration(
                "max_child_task_count must be at least 1".into(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(crate::Error::Configuration("concurrency must be at least 1".into()));
        }
        if self.worker.child_tasks_queue_size == 0 || self.worker.result_queue_size == 0 {
            return Err(crate::Error::Configuration("queue sizes must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> crate::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| crate::Error::Configuration(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker address (`host:port`)
    #[serde(default = "default_rpc_host")]
    pub rpc_host: String,

    /// Number of broker replicas behind `rpc_host`
    pub num_brokers: Option<usize>,

    /// Only fetch activations from this namespace
    pub namespace: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Move to another broker after this many fetched tasks (0 = never)
    #[serde(default = "default_max_tasks_before_rebalance")]
    pub max_tasks_before_rebalance: u64,

    /// Move to another broker after this many consecutive unavailable errors
    #[serde(default = "default_max_consecutive_unavailable")]
    pub max_consecutive_unavailable: u32,

    /// Seconds a delivery is remembered for routing its status update
    #[serde(default = "default_delivery_retention")]
    pub delivery_retention: u64,
}

fn default_rpc_host() -> String {
    "127.0.0.1:50051".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_tasks_before_rebalance() -> u64 {
    32
}

fn default_max_consecutive_unavailable() -> u32 {
    3
}

fn default_delivery_retention() -> u64 {
    3600
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            rpc_host: default_rpc_host(),
            num_brokers: None,
            namespace: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            max_tasks_before_rebalance: default_max_tasks_before_rebalance(),
            max_consecutive_unavailable: default_max_consecutive_unavailable(),
            delivery_retention: default_delivery_retention(),
        }
    }
}

impl BrokerConfig {
    /// Broker addresses, expanded for `num_brokers` replicas.
    ///
    /// `broker:50051` with three brokers becomes `broker-0:50051`,
    /// `broker-1:50051`, `broker-2:50051`.
    pub fn broker_hosts(&self) -> Vec<String> {
        let num = match self.num_brokers {
            Some(n) if n > 0 => n,
            _ => return vec![self.rpc_host.clone()],
        };
        let (host, port) = match self.rpc_host.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (self.rpc_host.as_str(), None),
        };
        (0..num)
            .map(|i| match port {
                Some(port) => format!("{}-{}:{}", host, i, port),
                None => format!("{}-{}", host, i),
            })
            .collect()
    }
}

/// How child executors are created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    /// Re-execute the worker binary as a child process
    #[default]
    #[serde(alias = "fork")]
    Spawn,
    /// Run children as threads of the worker process
    Thread,
}

impl std::str::FromStr for ProcessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spawn" | "fork" => Ok(ProcessType::Spawn),
            "thread" => Ok(ProcessType::Thread),
            _ => Err(format!("Unknown process type: {}", s)),
        }
    }
}

impl std::fmt::Display for ProcessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessType::Spawn => write!(f, "spawn"),
            ProcessType::Thread => write!(f, "thread"),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker ID (auto-generated if not specified)
    pub id: Option<String>,

    /// Number of child executors
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Tasks a child executes before it is replaced (None = unlimited)
    pub max_child_task_count: Option<u64>,

    /// Child creation strategy
    #[serde(default)]
    pub process_type: ProcessType,

    /// Capacity of the inbound activation queue
    #[serde(default = "default_child_tasks_queue_size")]
    pub child_tasks_queue_size: usize,

    /// Capacity of the outbound result queue
    #[serde(default = "default_result_queue_size")]
    pub result_queue_size: usize,

    /// Replace every activation's processing deadline, in seconds
    pub processing_deadline_override: Option<u64>,

    /// Deadline for activations that carry none, in seconds
    #[serde(default = "default_processing_deadline")]
    pub default_processing_deadline: u64,

    /// Scheduler tick in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Longest pause after consecutive empty fetches, in milliseconds
    #[serde(default = "default_max_idle_backoff_ms")]
    pub max_idle_backoff_ms: u64,

    /// How long `submit` waits for queue capacity, in milliseconds
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    /// Pause between attempts to report a result after a transient RPC error, in milliseconds
    #[serde(default = "default_rpc_retry_backoff_ms")]
    pub rpc_retry_backoff_ms: u64,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

fn default_child_tasks_queue_size() -> usize {
    5
}

fn default_result_queue_size() -> usize {
    5
}

fn default_processing_deadline() -> u64 {
    10
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_max_idle_backoff_ms() -> u64 {
    5_000
}

fn default_submit_timeout_ms() -> u64 {
    1_000
}

fn default_rpc_retry_backoff_ms() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            concurrency: default_concurrency(),
            max_child_task_count: None,
            process_type: ProcessType::default(),
            child_tasks_queue_size: default_child_tasks_queue_size(),
            result_queue_size: default_result_queue_size(),
            processing_deadline_override: None,
            default_processing_deadline: default_processing_deadline(),
            tick_interval_ms: default_tick_interval_ms(),
            max_idle_backoff_ms: default_max_idle_backoff_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            rpc_retry_backoff_ms: default_rpc_retry_backoff_ms(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl WorkerConfig {
    /// Get the worker ID, generating one if not set
    pub fn get_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string());
            format!("{}@{}", hostname, std::process::id())
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn max_idle_backoff(&self) -> Duration {
        Duration::from_millis(self.max_idle_backoff_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn rpc_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.rpc_retry_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn deadline_override(&self) -> Option<Duration> {
        self.processing_deadline_override.map(Duration::from_secs)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_processing_deadline)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty or compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TaskWorkerConfig::default();
        assert_eq!(config.broker.rpc_host, "127.0.0.1:50051");
        assert_eq!(config.worker.process_type, ProcessType::Spawn);
        assert!(config.worker.max_child_task_count.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broker_hosts_expansion() {
        let mut broker = BrokerConfig {
            rpc_host: "taskbroker:50051".to_string(),
            ..Default::default()
        };
        assert_eq!(broker.broker_hosts(), vec!["taskbroker:50051"]);

        broker.num_brokers = Some(3);
        assert_eq!(
            broker.broker_hosts(),
            vec!["taskbroker-0:50051", "taskbroker-1:50051", "taskbroker-2:50051"]
        );
    }

    #[test]
    fn test_process_type_parsing() {
        assert_eq!("spawn".parse::<ProcessType>().unwrap(), ProcessType::Spawn);
        assert_eq!("fork".parse::<ProcessType>().unwrap(), ProcessType::Spawn);
        assert_eq!("Thread".parse::<ProcessType>().unwrap(), ProcessType::Thread);
        assert!("forkserver".parse::<ProcessType>().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[broker]
rpc_host = "taskbroker:50051"
num_brokers = 2

[worker]
concurrency = 3
max_child_task_count = 100
process_type = "fork"
"#
        )
        .unwrap();

        let config = TaskWorkerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.broker.num_brokers, Some(2));
        assert_eq!(config.worker.concurrency, 3);
        assert_eq!(config.worker.max_child_task_count, Some(100));
        assert_eq!(config.worker.process_type, ProcessType::Spawn);
        // untouched sections keep their defaults
        assert_eq!(config.worker.child_tasks_queue_size, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = TaskWorkerConfig::default();
        config.worker.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(crate::Error::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_child_task_count() {
        let mut config = TaskWorkerConfig::default();
        config.worker.max_child_task_count = Some(0);
        assert!(matches!(
            config.validate(),
            Err(crate::Error::Configuration(_))
        ));

        config.worker.max_child_task_count = Some(1);
        assert!(config.validate().is_ok());
    }
}
