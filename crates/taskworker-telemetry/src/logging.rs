//! Structured logging for the taskworker
//!
//! Provides structured logging with:
//! - Configurable log levels and env-style filter directives
//! - JSON, pretty or compact output
//! - A stderr writer for child processes, whose stdout carries frames
//! - Task context spans

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{TelemetryError, TelemetryResult};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,

    /// Log level or filter directive (e.g. "info", "taskworker=debug,h2=warn")
    pub level: String,

    /// Output format (json, pretty, compact)
    pub format: LogFormat,

    /// Output stream
    pub writer: LogWriter,

    /// Include span events
    pub include_spans: bool,

    /// Include file/line information
    pub include_location: bool,

    /// Include target (module path)
    pub include_target: bool,

    /// Include thread names
    pub include_thread_names: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable)
    Json,
    /// Pretty format (human-readable, colored)
    Pretty,
    /// Compact format (single line)
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(TelemetryError::Config(format!("unknown log format: {}", other))),
        }
    }
}

/// Where log lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogWriter {
    #[default]
    Stdout,
    Stderr,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            format: LogFormat::Compact,
            writer: LogWriter::Stdout,
            include_spans: false,
            include_location: false,
            include_target: true,
            include_thread_names: true,
        }
    }
}

impl LoggingConfig {
    /// Configuration for a child process: same filter and format, written to stderr
    pub fn for_child(mut self) -> Self {
        self.writer = LogWriter::Stderr;
        self
    }
}

/// Initialize logging with configuration.
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init_logging(config: LoggingConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| TelemetryError::Logging(e.to_string()))?;

    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let writer = || match config.writer {
        LogWriter::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogWriter::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(writer())
                    .with_timer(UtcTime::rfc_3339())
                    .with_span_events(span_events)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(config.include_target)
                    .with_thread_names(config.include_thread_names),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(writer())
                    .with_timer(UtcTime::rfc_3339())
                    .with_span_events(span_events)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(config.include_target)
                    .with_thread_names(config.include_thread_names),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(writer())
                    .with_timer(UtcTime::rfc_3339())
                    .with_span_events(span_events)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(config.include_target)
                    .with_thread_names(config.include_thread_names),
            )
            .try_init(),
    };
    result.map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing::debug!(
        level = %config.level,
        format = ?config.format,
        writer = ?config.writer,
        "Logging initialized"
    );

    Ok(())
}

/// Log context for one activation
#[derive(Debug, Clone)]
pub struct TaskLogContext {
    pub task_id: String,
    pub namespace: String,
    pub taskname: String,
}

impl TaskLogContext {
    pub fn new(task_id: &str, namespace: &str, taskname: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            namespace: namespace.to_string(),
            taskname: taskname.to_string(),
        }
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "task",
            task_id = %self.task_id,
            namespace = %self.namespace,
            taskname = %self.taskname
        )
    }
}

/// Log task started
#[macro_export]
macro_rules! log_task_started {
    ($task_id:expr, $taskname:expr, $namespace:expr) => {
        tracing::debug!(
            task_id = %$task_id,
            taskname = %$taskname,
            namespace = %$namespace,
            event = "task.started",
            "Task execution started"
        )
    };
}

/// Log task completed
#[macro_export]
macro_rules! log_task_completed {
    ($task_id:expr, $taskname:expr, $namespace:expr, $duration_ms:expr) => {
        tracing::info!(
            task_id = %$task_id,
            taskname = %$taskname,
            namespace = %$namespace,
            duration_ms = $duration_ms,
            event = "task.completed",
            "Task completed successfully"
        )
    };
}

/// Log task failed
#[macro_export]
macro_rules! log_task_failed {
    ($task_id:expr, $taskname:expr, $namespace:expr, $error:expr) => {
        tracing::error!(
            task_id = %$task_id,
            taskname = %$taskname,
            namespace = %$namespace,
            error = %$error,
            event = "task.failed",
            "Task execution failed"
        )
    };
}

/// Log task retried
#[macro_export]
macro_rules! log_task_retried {
    ($task_id:expr, $taskname:expr, $namespace:expr, $attempts:expr, $error:expr) => {
        tracing::warn!(
            task_id = %$task_id,
            taskname = %$taskname,
            namespace = %$namespace,
            attempts = $attempts,
            error = %$error,
            event = "task.retried",
            "Task scheduled for retry"
        )
    };
}
