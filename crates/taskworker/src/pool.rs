//! Child pool management
//!
//! The pool owns the bounded inbound queue (activations waiting for a child)
//! and the bounded outbound queue (results waiting for the reporter), and keeps
//! a fixed number of children alive, replacing any that exit.

use crate::child::{
    ActivationSource, ChildExecutor, ChildExit, Fetch, ResultSink, DEADLINE_EXCEEDED_EXIT_CODE,
};
use crate::idempotency::AtMostOnceGate;
use crate::ipc::{kill_graceful, spawn_process, BridgeQueues, ProcessChild, ProcessCommand};
use crate::shutdown::ShutdownSignal;
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use taskworker_core::{FrameCodec, ProcessingResult, Serializer, TaskActivation};
use taskworker_telemetry::WorkerMetrics;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How long a reaped child's bridge gets to forward what the child wrote last
const BRIDGE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// The inbound queue stayed full; the activation is handed back
    #[error("inbound queue is full")]
    Full(Box<TaskActivation>),

    #[error("pool is shut down")]
    Closed,

    #[error("failed to start child: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How children are started
pub enum ChildLauncher {
    /// Children are threads in this process
    Thread(Arc<ChildExecutor>),
    /// Children are separate processes
    Process(ProcessCommand),
}

/// Pool settings
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of children kept alive
    pub concurrency: usize,

    /// Capacity of the inbound queue
    pub inbound_capacity: usize,

    /// Capacity of the outbound queue
    pub outbound_capacity: usize,

    /// How often idle bridges check for shutdown
    pub poll_interval: Duration,

    /// Pipe serialization for process children
    pub serializer: Serializer,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            inbound_capacity: 5,
            outbound_capacity: 5,
            poll_interval: Duration::from_millis(100),
            serializer: Serializer::default(),
        }
    }
}

enum ChildHandle {
    Thread(JoinHandle<ChildExit>),
    Process(ProcessChild),
}

struct ChildSlot {
    /// Slot index
    id: usize,

    /// Running child, if any
    handle: Option<ChildHandle>,

    /// Results produced by children in this slot
    processed: Arc<AtomicU64>,

    /// Children started in this slot
    generation: u64,
}

/// Fixed-size pool of children fed by the inbound queue
pub struct WorkerPool {
    /// How children are started
    launcher: ChildLauncher,

    /// Configuration
    options: PoolOptions,

    inbound_tx: Sender<TaskActivation>,
    inbound_rx: Receiver<TaskActivation>,
    outbound_tx: Sender<ProcessingResult>,
    outbound_rx: Receiver<ProcessingResult>,

    /// Child slots
    slots: Mutex<Vec<ChildSlot>>,

    /// Tells children to stop
    shutdown: ShutdownSignal,

    /// Cleared once shutdown starts
    accepting: AtomicBool,

    /// Filters repeat deliveries of at-most-once tasks
    at_most_once: Option<Arc<AtMostOnceGate>>,
}

impl WorkerPool {
    /// Create a pool. No children run until [`WorkerPool::spawn_children`].
    pub fn new(launcher: ChildLauncher, options: PoolOptions) -> Self {
        let (inbound_tx, inbound_rx) = channel::bounded(options.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = channel::bounded(options.outbound_capacity.max(1));
        let slots = (0..options.concurrency.max(1))
            .map(|id| ChildSlot {
                id,
                handle: None,
                processed: Arc::new(AtomicU64::new(0)),
                generation: 0,
            })
            .collect();

        Self {
            launcher,
            options,
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            slots: Mutex::new(slots),
            shutdown: ShutdownSignal::new(),
            accepting: AtomicBool::new(true),
            at_most_once: None,
        }
    }

    /// Check every activation against `gate` before a child gets it
    pub fn with_at_most_once(mut self, gate: Arc<AtMostOnceGate>) -> Self {
        self.at_most_once = Some(gate);
        self
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Start a child in every empty slot. Returns how many were started.
    pub fn spawn_children(&self) -> Result<usize, PoolError> {
        if !self.is_accepting() {
            return Ok(0);
        }

        let mut slots = self.slots.lock();
        let mut started = 0;
        for slot in slots.iter_mut().filter(|s| s.handle.is_none()) {
            let handle = self.launch(slot)?;
            slot.handle = Some(handle);
            slot.generation += 1;
            started += 1;
            WorkerMetrics::child_spawned();
            debug!(slot = slot.id, generation = slot.generation, "Started child");
        }
        WorkerMetrics::set_live_children(Self::count_live(&slots) as i64);
        Ok(started)
    }

    fn launch(&self, slot: &ChildSlot) -> Result<ChildHandle, PoolError> {
        match &self.launcher {
            ChildLauncher::Thread(executor) => {
                let executor = Arc::clone(executor);
                let mut source = GatedSource {
                    inner: self.inbound_rx.clone(),
                    gate: self.at_most_once.clone(),
                };
                let mut sink = self.outbound_tx.clone();
                let shutdown = self.shutdown.clone();
                let processed = Arc::clone(&slot.processed);
                let handle = std::thread::Builder::new()
                    .name(format!("child-{}", slot.id))
                    .spawn(move || {
                        let mut counting = CountingSink {
                            inner: &mut sink,
                            processed,
                        };
                        executor.run(&mut source, &mut counting, &shutdown)
                    })?;
                Ok(ChildHandle::Thread(handle))
            }
            ChildLauncher::Process(command) => {
                let process = spawn_process(
                    command,
                    FrameCodec::new(self.options.serializer),
                    BridgeQueues {
                        inbound: self.inbound_rx.clone(),
                        requeue: self.inbound_tx.clone(),
                        outbound: self.outbound_tx.clone(),
                    },
                    self.shutdown.clone(),
                    self.options.poll_interval,
                    Arc::clone(&slot.processed),
                    self.at_most_once.clone(),
                )?;
                info!(slot = slot.id, pid = process.child.id(), "Spawned child process");
                Ok(ChildHandle::Process(process))
            }
        }
    }

    /// Collect exited children. Returns how many were reaped.
    pub fn reap(&self) -> usize {
        let mut slots = self.slots.lock();
        let mut reaped = 0;

        for slot in slots.iter_mut() {
            let finished = match &mut slot.handle {
                Some(ChildHandle::Thread(handle)) => handle.is_finished(),
                Some(ChildHandle::Process(process)) => match process.child.try_wait() {
                    Ok(Some(_)) => true,
                    Ok(None) => false,
                    Err(e) => {
                        error!(slot = slot.id, "Failed to poll child: {}", e);
                        false
                    }
                },
                None => false,
            };
            if !finished {
                continue;
            }

            match slot.handle.take() {
                Some(ChildHandle::Thread(handle)) => match handle.join() {
                    Ok(ChildExit::DeadlineExceeded) => {
                        warn!(slot = slot.id, "Child ended after a deadline was exceeded")
                    }
                    Ok(exit) => debug!(slot = slot.id, ?exit, "Child ended"),
                    Err(_) => error!(slot = slot.id, "Child thread panicked"),
                },
                Some(ChildHandle::Process(mut process)) => {
                    let code = process.child.wait().ok().and_then(|status| status.code());
                    if code == Some(DEADLINE_EXCEEDED_EXIT_CODE) {
                        warn!(slot = slot.id, "Child process ended after a deadline was exceeded");
                    } else {
                        debug!(slot = slot.id, ?code, "Child process ended");
                    }
                    join_bridge(slot.id, process.bridge, BRIDGE_JOIN_TIMEOUT);
                }
                None => {}
            }
            reaped += 1;
        }

        WorkerMetrics::set_live_children(Self::count_live(&slots) as i64);
        reaped
    }

    /// Reap exited children and start replacements
    pub fn reap_and_respawn(&self) -> Result<usize, PoolError> {
        let reaped = self.reap();
        if reaped > 0 {
            self.spawn_children()?;
        }
        Ok(reaped)
    }

    /// Keep the pool at full size until `stop` is set or the pool shuts down
    pub fn run_supervisor(&self, interval: Duration, stop: &ShutdownSignal) {
        while !stop.is_set() && self.is_accepting() {
            if let Err(e) = self.reap_and_respawn() {
                error!("Failed to replace child: {}", e);
            }
            WorkerMetrics::set_inbound_depth(self.inbound_len() as i64);
            std::thread::sleep(interval);
        }
        debug!("Pool supervisor stopped");
    }

    /// Queue an activation, waiting up to `timeout` for room
    pub fn submit(&self, activation: TaskActivation, timeout: Duration) -> Result<(), PoolError> {
        if !self.is_accepting() {
            return Err(PoolError::Closed);
        }
        match self.inbound_tx.send_timeout(activation, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(activation)) => Err(PoolError::Full(Box::new(activation))),
            Err(SendTimeoutError::Disconnected(_)) => Err(PoolError::Closed),
        }
    }

    /// Queue an activation without waiting
    pub fn try_submit(&self, activation: TaskActivation) -> Result<(), PoolError> {
        if !self.is_accepting() {
            return Err(PoolError::Closed);
        }
        match self.inbound_tx.try_send(activation) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(activation)) => Err(PoolError::Full(Box::new(activation))),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Closed),
        }
    }

    /// Whether the inbound queue has room
    pub fn has_capacity(&self) -> bool {
        self.is_accepting() && !self.inbound_tx.is_full()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound_tx.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound_rx.len()
    }

    /// Receiving end of the outbound queue
    pub fn results(&self) -> Receiver<ProcessingResult> {
        self.outbound_rx.clone()
    }

    /// Sending end of the outbound queue
    pub(crate) fn result_sender(&self) -> Sender<ProcessingResult> {
        self.outbound_tx.clone()
    }

    #[cfg(test)]
    pub(crate) fn inbound_receiver(&self) -> Receiver<TaskActivation> {
        self.inbound_rx.clone()
    }

    pub fn live_children(&self) -> usize {
        Self::count_live(&self.slots.lock())
    }

    /// Results produced by all children so far
    pub fn processed(&self) -> u64 {
        self.slots
            .lock()
            .iter()
            .map(|s| s.processed.load(Ordering::Relaxed))
            .sum()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn count_live(slots: &[ChildSlot]) -> usize {
        slots.iter().filter(|s| s.handle.is_some()).count()
    }

    /// Stop the pool: children finish their current activation and exit.
    /// Children still running after `grace` are terminated.
    pub fn shutdown(&self, grace: Duration) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(
            live = self.live_children(),
            queued = self.inbound_len(),
            "Shutting down child pool"
        );
        self.shutdown.trigger();

        let deadline = Instant::now() + grace;
        loop {
            self.reap();
            if self.live_children() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        {
            let mut slots = self.slots.lock();
            for slot in slots.iter_mut() {
                match slot.handle.take() {
                    Some(ChildHandle::Process(mut process)) => {
                        warn!(slot = slot.id, pid = process.child.id(), "Terminating child process");
                        if let Err(e) = kill_graceful(&mut process.child, Duration::from_secs(1)) {
                            error!(slot = slot.id, "Failed to terminate child: {}", e);
                        }
                        join_bridge(slot.id, process.bridge, BRIDGE_JOIN_TIMEOUT);
                    }
                    Some(ChildHandle::Thread(_)) => {
                        warn!(slot = slot.id, "Abandoning child thread that did not stop in time");
                    }
                    None => {}
                }
            }
        }
        WorkerMetrics::set_live_children(0);

        let dropped = self.inbound_rx.try_iter().count();
        if dropped > 0 {
            info!(dropped, "Discarded queued activations; the broker will redeliver them");
        }
        info!(processed = self.processed(), "Child pool stopped");
    }
}

/// Wait up to `timeout` for a bridge thread to drain its child's pipe
fn join_bridge(slot: usize, bridge: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !bridge.is_finished() {
        if Instant::now() >= deadline {
            warn!(slot, "Bridge still running after its child ended, leaving it");
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if bridge.join().is_err() {
        error!(slot, "Bridge thread panicked");
    }
}

/// Inbound queue as seen by a thread child
struct GatedSource {
    inner: Receiver<TaskActivation>,
    gate: Option<Arc<AtMostOnceGate>>,
}

impl ActivationSource for GatedSource {
    fn fetch(&mut self, timeout: Duration) -> Fetch {
        match ActivationSource::fetch(&mut self.inner, timeout) {
            Fetch::Activation(activation) => match &self.gate {
                Some(gate) if !gate.admit(&activation) => Fetch::Empty,
                _ => Fetch::Activation(activation),
            },
            other => other,
        }
    }
}

/// Counts results a thread child hands over
struct CountingSink<'a> {
    inner: &'a mut Sender<ProcessingResult>,
    processed: Arc<AtomicU64>,
}

impl ResultSink for CountingSink<'_> {
    fn send(&mut self, result: ProcessingResult) -> bool {
        let sent = ResultSink::send(&mut *self.inner, result);
        if sent {
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::ChildOptions;
    use crate::handlers::register_builtin_tasks;
    use crate::idempotency::MemoryAtMostOnceStore;
    use crate::monitor::TracingMonitor;
    use crate::registry::TaskRegistry;
    use taskworker_core::ActivationStatus;

    fn thread_pool(concurrency: usize, max_task_count: Option<u64>) -> WorkerPool {
        let mut registry = TaskRegistry::new();
        register_builtin_tasks(&mut registry).unwrap();
        let registry = Arc::new(registry);
        let options = ChildOptions {
            max_task_count,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let gate = AtMostOnceGate::new(
            Arc::clone(&registry),
            Arc::new(MemoryAtMostOnceStore::new()),
            options.clone(),
        );
        let executor = ChildExecutor::new(registry, Arc::new(TracingMonitor), options);
        WorkerPool::new(
            ChildLauncher::Thread(Arc::new(executor)),
            PoolOptions {
                concurrency,
                inbound_capacity: 2,
                outbound_capacity: 10,
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .with_at_most_once(Arc::new(gate))
    }

    fn simple(id: &str) -> TaskActivation {
        TaskActivation::new(id, "examples", "examples.simple_task").deadline(Duration::from_secs(2))
    }

    #[test]
    fn test_submit_full_returns_activation() {
        let pool = thread_pool(1, None);
        pool.try_submit(simple("1")).unwrap();
        pool.try_submit(simple("2")).unwrap();
        assert!(!pool.has_capacity());

        match pool.submit(simple("3"), Duration::from_millis(10)) {
            Err(PoolError::Full(activation)) => assert_eq!(activation.id, "3"),
            other => panic!("unexpected submit result {:?}", other),
        }
        assert_eq!(pool.inbound_len(), 2);
    }

    #[test]
    fn test_thread_children_process_queue() {
        let pool = thread_pool(2, None);
        assert_eq!(pool.spawn_children().unwrap(), 2);
        assert_eq!(pool.live_children(), 2);

        pool.submit(simple("1"), Duration::from_secs(1)).unwrap();
        pool.submit(simple("2"), Duration::from_secs(1)).unwrap();

        let results = pool.results();
        let mut ids: Vec<String> = (0..2)
            .map(|_| results.recv_timeout(Duration::from_secs(5)).unwrap())
            .inspect(|r| assert_eq!(r.status, ActivationStatus::Complete))
            .map(|r| r.task_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);

        pool.shutdown(Duration::from_secs(2));
        assert_eq!(pool.live_children(), 0);
        assert!(matches!(pool.try_submit(simple("3")), Err(PoolError::Closed)));
    }

    #[test]
    fn test_retired_children_are_replaced() {
        let pool = thread_pool(1, Some(1));
        pool.spawn_children().unwrap();

        for id in ["1", "2", "3"] {
            pool.submit(simple(id), Duration::from_secs(1)).unwrap();
            pool.results().recv_timeout(Duration::from_secs(5)).unwrap();
            // wait for the retired child to be reaped and replaced
            let started = Instant::now();
            while pool.reap_and_respawn().unwrap() == 0 && started.elapsed() < Duration::from_secs(5) {
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        assert_eq!(pool.processed(), 3);
        assert_eq!(pool.live_children(), 1);
        pool.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_shutdown_returns_with_info_logging() {
        let pool = Arc::new(thread_pool(2, None));
        pool.spawn_children().unwrap();
        pool.submit(simple("1"), Duration::from_secs(1)).unwrap();
        pool.results().recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = channel::bounded(1);
        let stopping = Arc::clone(&pool);
        std::thread::spawn(move || {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::INFO)
                .with_test_writer()
                .finish();
            tracing::subscriber::with_default(subscriber, || {
                stopping.shutdown(Duration::from_secs(2))
            });
            let _ = done_tx.send(());
        });

        assert!(
            done_rx.recv_timeout(Duration::from_secs(10)).is_ok(),
            "shutdown did not return"
        );
        assert_eq!(pool.live_children(), 0);
        assert_eq!(pool.processed(), 1);
    }

    #[test]
    fn test_repeat_at_most_once_delivery_runs_once() {
        let pool = thread_pool(2, None);
        pool.spawn_children().unwrap();

        let at_most_once = || {
            TaskActivation::new("555", "examples", "examples.at_most_once")
                .deadline(Duration::from_secs(2))
        };
        pool.submit(at_most_once(), Duration::from_secs(1)).unwrap();
        pool.submit(at_most_once(), Duration::from_secs(1)).unwrap();
        pool.submit(simple("111"), Duration::from_secs(1)).unwrap();

        let results = pool.results();
        let mut ids: Vec<String> = (0..2)
            .map(|_| results.recv_timeout(Duration::from_secs(5)).unwrap().task_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["111", "555"]);
        assert!(results.recv_timeout(Duration::from_millis(300)).is_err());

        pool.shutdown(Duration::from_secs(2));
    }
}
