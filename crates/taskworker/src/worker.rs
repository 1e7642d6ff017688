//! TaskWorker: fetch loop, lifecycle and shutdown
//!
//! The worker runs its fetch loop on the calling thread. A result thread runs
//! the [`ResultReporter`] and a supervisor thread keeps the child pool at full
//! size. Broker calls are made from these plain threads through a tokio
//! runtime handle.

use crate::pool::{PoolError, WorkerPool};
use crate::reporter::{ReporterOptions, ResultReporter};
use crate::shutdown::ShutdownSignal;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use taskworker_client::BrokerClient;
use taskworker_core::{TaskActivation, WorkerConfig};
use taskworker_telemetry::WorkerMetrics;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Worker lifecycle. There is no way back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// Outcome of one scheduler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// An activation went into the inbound queue
    Submitted,
    /// The broker had nothing for us
    Idle,
    /// The inbound queue had no room
    Saturated,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker cannot start from state {0:?}")]
    InvalidState(WorkerState),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to start thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Pulls activations from a broker and feeds them to a child pool
pub struct TaskWorker<C> {
    /// Worker ID
    worker_id: String,

    /// Broker client
    client: Arc<C>,

    /// Child pool
    pool: Arc<WorkerPool>,

    /// Configuration
    config: WorkerConfig,

    /// Namespace to fetch from
    namespace: Option<String>,

    /// Runtime used for broker calls
    handle: Handle,

    state: Mutex<WorkerState>,

    /// Stops the fetch loop and the pool supervisor
    stop: ShutdownSignal,

    /// Stops the result reporter once the pool has drained
    reporter_stop: ShutdownSignal,

    threads: Mutex<Vec<JoinHandle<()>>>,

    /// Activation fetched while the inbound queue was full
    pending: Mutex<Option<TaskActivation>>,

    /// Consecutive ticks without work
    idle_ticks: Mutex<u32>,
}

impl<C: BrokerClient + 'static> TaskWorker<C> {
    pub fn new(
        client: Arc<C>,
        pool: Arc<WorkerPool>,
        config: WorkerConfig,
        namespace: Option<String>,
        handle: Handle,
    ) -> Self {
        Self {
            worker_id: config.get_id(),
            client,
            pool,
            config,
            namespace,
            handle,
            state: Mutex::new(WorkerState::Created),
            stop: ShutdownSignal::new(),
            reporter_stop: ShutdownSignal::new(),
            threads: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            idle_ticks: Mutex::new(0),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Signal that stops [`TaskWorker::run`]; safe to trigger from another thread
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.stop.clone()
    }

    /// Start the result thread and the pool. Moves the worker to `Running`.
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let state = self.state.lock();
            if *state != WorkerState::Created {
                return Err(WorkerError::InvalidState(*state));
            }
        }
        self.start_result_thread()?;
        self.start_spawn_children_thread()?;
        *self.state.lock() = WorkerState::Running;
        info!(
            worker_id = %self.worker_id,
            concurrency = self.config.concurrency,
            process_type = %self.config.process_type,
            "Worker started"
        );
        Ok(())
    }

    /// Start the thread that reports results to the broker
    pub fn start_result_thread(&self) -> Result<(), WorkerError> {
        let reporter = ResultReporter::new(
            Arc::clone(&self.client),
            self.handle.clone(),
            Arc::clone(&self.pool),
            ReporterOptions {
                namespace: self.namespace.clone(),
                retry_backoff: self.config.rpc_retry_backoff(),
                submit_timeout: self.config.submit_timeout(),
                poll_interval: self.config.tick_interval(),
            },
        );
        let stop = self.reporter_stop.clone();
        let handle = std::thread::Builder::new()
            .name("result-reporter".to_string())
            .spawn(move || reporter.run(&stop))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Spawn the children and start the thread that replaces exited ones
    pub fn start_spawn_children_thread(&self) -> Result<(), WorkerError> {
        self.pool.spawn_children()?;

        let pool = Arc::clone(&self.pool);
        let stop = self.stop.clone();
        let interval = self.config.tick_interval();
        let handle = std::thread::Builder::new()
            .name("pool-supervisor".to_string())
            .spawn(move || pool.run_supervisor(interval, &stop))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Ask the broker for one activation. Errors are logged and count as "nothing".
    pub fn fetch_task(&self) -> Option<TaskActivation> {
        match self
            .handle
            .block_on(self.client.get_task(self.namespace.as_deref()))
        {
            Ok(Some(activation)) => {
                WorkerMetrics::task_fetched("get_task");
                debug!(task_id = %activation.id, taskname = %activation.taskname, "Fetched activation");
                Some(activation)
            }
            Ok(None) => None,
            Err(e) => {
                WorkerMetrics::rpc_error("get_task", e.code_name());
                if e.is_transient() {
                    warn!(error = %e, "Broker unavailable while fetching");
                } else {
                    error!(error = %e, "Fetching from broker failed");
                }
                None
            }
        }
    }

    /// One scheduler tick: fetch an activation if the pool has room and queue it
    pub fn run_once(&self) -> Tick {
        let mut pending = self.pending.lock();

        let activation = match pending.take() {
            Some(activation) => activation,
            None => {
                if !self.pool.has_capacity() {
                    return Tick::Saturated;
                }
                match self.fetch_task() {
                    Some(activation) => activation,
                    None => return Tick::Idle,
                }
            }
        };

        match self.pool.submit(activation, self.config.submit_timeout()) {
            Ok(()) => Tick::Submitted,
            Err(PoolError::Full(activation)) => {
                // hold on to it; it goes in first on the next tick
                *pending = Some(*activation);
                Tick::Saturated
            }
            Err(e) => {
                warn!(error = %e, "Could not queue activation");
                Tick::Saturated
            }
        }
    }

    /// Delay before the next tick
    fn next_delay(&self, tick: Tick) -> Duration {
        let mut idle = self.idle_ticks.lock();
        match tick {
            Tick::Submitted => {
                *idle = 0;
                Duration::ZERO
            }
            Tick::Saturated => {
                *idle = 0;
                self.config.tick_interval()
            }
            Tick::Idle => {
                *idle = idle.saturating_add(1);
                let backoff = self.config.tick_interval() * *idle;
                backoff.min(self.config.max_idle_backoff())
            }
        }
    }

    /// Run the scheduler loop until the shutdown signal fires, then shut down
    pub fn run(&self) -> Result<(), WorkerError> {
        if self.state() == WorkerState::Created {
            self.start()?;
        }

        while !self.stop.is_set() {
            let tick = self.run_once();
            let delay = self.next_delay(tick);
            if !delay.is_zero() {
                self.sleep_unless_stopped(delay);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn sleep_unless_stopped(&self, delay: Duration) {
        let step = Duration::from_millis(50);
        let mut remaining = delay;
        while !remaining.is_zero() && !self.stop.is_set() {
            let nap = remaining.min(step);
            std::thread::sleep(nap);
            remaining -= nap;
        }
    }

    /// Stop fetching, drain the pool, stop the reporter and join every thread
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                WorkerState::ShuttingDown | WorkerState::Stopped => return,
                _ => *state = WorkerState::ShuttingDown,
            }
        }
        info!(worker_id = %self.worker_id, "Worker shutting down...");

        self.stop.trigger();
        if let Some(activation) = self.pending.lock().take() {
            debug!(task_id = %activation.id, "Releasing held activation to the broker");
        }

        self.pool.shutdown(self.config.shutdown_grace());
        self.reporter_stop.trigger();

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        *self.state.lock() = WorkerState::Stopped;
        info!(
            worker_id = %self.worker_id,
            processed = self.pool.processed(),
            "Worker stopped"
        );
    }
}
