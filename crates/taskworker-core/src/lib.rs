//! Taskworker Core - shared types for the taskworker
//!
//! This crate provides the building blocks used by the worker and its broker client:
//! - Task activations, retry state and processing results
//! - Child process framing
//! - Configuration structures
//! - Error types

pub mod activation;
pub mod config;
pub mod error;
pub mod message;

pub use activation::{
    ActivationStatus, FailureReason, FetchNextTask, OnAttemptsExceeded, Parameters,
    ProcessingResult, RetryState, TaskActivation, MONITOR_CHECK_IN_ID_HEADER,
    MONITOR_SLUG_HEADER,
};
pub use config::{BrokerConfig, LoggingConfig, ProcessType, TaskWorkerConfig, WorkerConfig};
pub use error::{Error, Result};
pub use message::{ChildMessage, FrameCodec, ParentMessage, Serializer};
