//! Taskworker - Main entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use taskworker::{
    child_main, register_builtin_tasks, AtMostOnceGate, ChildExecutor, ChildLauncher,
    ChildOptions, MemoryAtMostOnceStore, PoolOptions, ProcessCommand, TaskRegistry, TaskWorker,
    TracingMonitor, WorkerPool,
};
use taskworker_client::GrpcBrokerClient;
use taskworker_core::{ProcessType, Serializer, TaskWorkerConfig};
use taskworker_telemetry::{init_logging, LogFormat, LoggingConfig, WorkerMetrics};
use tracing::{info, warn};

/// Taskworker - pulls task activations from a broker and runs them in child processes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the worker (default)
    Run(RunArgs),

    /// Run one child executor on stdin/stdout
    #[command(hide = true)]
    Child(ChildArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Configuration file path
    #[arg(short, long, env = "TASKWORKER_CONFIG")]
    config: Option<String>,

    /// Broker address (host:port)
    #[arg(long)]
    rpc_host: Option<String>,

    /// Number of broker replicas behind rpc_host
    #[arg(long)]
    num_brokers: Option<usize>,

    /// Namespace to fetch activations from
    #[arg(long)]
    namespace: Option<String>,

    /// Number of child executors
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,

    /// Tasks a child runs before it is replaced
    #[arg(long)]
    max_child_task_count: Option<u64>,

    /// How children are created (spawn, fork, thread)
    #[arg(long)]
    process_type: Option<ProcessType>,

    /// Processing deadline in seconds, replacing the activation's own
    #[arg(long)]
    processing_deadline_override: Option<u64>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (json, pretty, compact)
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[derive(Args, Debug, Clone)]
struct ChildArgs {
    /// Tasks to run before exiting
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    max_task_count: Option<u64>,

    /// Deadline in seconds for activations that carry none
    #[arg(long, default_value_t = 10)]
    default_deadline: u64,

    /// Deadline in seconds applied to every activation
    #[arg(long)]
    deadline_override: Option<u64>,

    /// Pipe serialization (json, msgpack)
    #[arg(long, default_value = "msgpack")]
    serializer: Serializer,

    /// Log level or filter directive
    #[arg(long, env = "TASKWORKER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run(cli.run)) {
        Command::Run(args) => run_worker(args),
        Command::Child(args) => run_child(args),
    }
}

fn build_registry() -> Result<Arc<TaskRegistry>> {
    let mut registry = TaskRegistry::new();
    register_builtin_tasks(&mut registry).context("failed to register tasks")?;
    Ok(Arc::new(registry))
}

fn run_worker(args: RunArgs) -> Result<()> {
    let mut config = TaskWorkerConfig::load(args.config.as_deref())?;

    // Override with CLI args
    if let Some(rpc_host) = args.rpc_host {
        config.broker.rpc_host = rpc_host;
    }
    if let Some(num_brokers) = args.num_brokers {
        config.broker.num_brokers = Some(num_brokers);
    }
    if let Some(namespace) = args.namespace {
        config.broker.namespace = Some(namespace);
    }
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    if let Some(max) = args.max_child_task_count {
        config.worker.max_child_task_count = Some(max);
    }
    if let Some(process_type) = args.process_type {
        config.worker.process_type = process_type;
    }
    if let Some(secs) = args.processing_deadline_override {
        config.worker.processing_deadline_override = Some(secs);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    let format = match args.log_format {
        Some(format) => format,
        None => config.logging.format.parse()?,
    };
    init_logging(LoggingConfig {
        level: config.logging.level.clone(),
        format,
        ..Default::default()
    })?;
    if let Err(e) = WorkerMetrics::register() {
        warn!("Failed to register metrics: {}", e);
    }

    info!("Starting Taskworker v{}", env!("CARGO_PKG_VERSION"));
    info!("Broker: {:?}", config.broker.broker_hosts());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("taskworker-rpc")
        .build()
        .context("failed to start runtime")?;

    let client = {
        let _guard = runtime.enter();
        Arc::new(GrpcBrokerClient::new(&config.broker)?)
    };

    let child_options = ChildOptions {
        max_task_count: config.worker.max_child_task_count,
        poll_interval: config.worker.tick_interval(),
        default_deadline: config.worker.default_deadline(),
        deadline_override: config.worker.deadline_override(),
        ..Default::default()
    };
    let serializer = Serializer::default();

    // one record for every child, whichever process runs it
    let registry = build_registry()?;
    let at_most_once = Arc::new(AtMostOnceGate::new(
        Arc::clone(&registry),
        Arc::new(MemoryAtMostOnceStore::new()),
        child_options.clone(),
    ));

    let launcher = match config.worker.process_type {
        ProcessType::Spawn => ChildLauncher::Process(
            ProcessCommand::current_exe()
                .context("failed to locate worker executable")?
                .child_args(&child_options, serializer),
        ),
        ProcessType::Thread => ChildLauncher::Thread(Arc::new(ChildExecutor::new(
            registry,
            Arc::new(TracingMonitor),
            child_options,
        ))),
    };

    let pool = Arc::new(WorkerPool::new(
        launcher,
        PoolOptions {
            concurrency: config.worker.concurrency,
            inbound_capacity: config.worker.child_tasks_queue_size,
            outbound_capacity: config.worker.result_queue_size,
            poll_interval: config.worker.tick_interval(),
            serializer,
        },
    )
    .with_at_most_once(at_most_once));

    let worker = TaskWorker::new(
        client,
        pool,
        config.worker.clone(),
        config.broker.namespace.clone(),
        runtime.handle().clone(),
    );

    // Set up signal handlers
    let signal = worker.shutdown_signal();
    runtime.spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received shutdown signal");
            signal.trigger();
        }
    });

    info!(worker_id = %worker.worker_id(), "Taskworker ready");

    worker.run()?;

    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

fn run_child(args: ChildArgs) -> Result<()> {
    init_logging(
        LoggingConfig {
            level: args.log_level.clone(),
            include_thread_names: false,
            ..Default::default()
        }
        .for_child(),
    )?;

    // at-most-once checks and metrics stay with the worker
    let executor = ChildExecutor::new(
        build_registry()?,
        Arc::new(TracingMonitor),
        ChildOptions {
            max_task_count: args.max_task_count,
            default_deadline: Duration::from_secs(args.default_deadline),
            deadline_override: args.deadline_override.map(Duration::from_secs),
            record_metrics: false,
            ..Default::default()
        },
    );

    // exiting the process also ends a handler thread left behind by a deadline
    std::process::exit(child_main(executor, args.serializer));
}
