//! Broker client trait definitions

use async_trait::async_trait;
use taskworker_core::{ActivationStatus, FetchNextTask, TaskActivation};
use thiserror::Error;
use tonic::Code;

/// Result type for broker RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// A failed broker call, classified by its gRPC status code
#[derive(Error, Debug, Clone)]
#[error("broker rpc failed ({code:?}): {message}")]
pub struct RpcError {
    /// gRPC status code
    pub code: Code,

    /// Human-readable detail
    pub message: String,
}

impl RpcError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The broker could not be reached
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// The request was rejected and should not be repeated
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Network or availability failures that are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self.code, Code::Unavailable | Code::DeadlineExceeded)
    }

    /// Short code name for logs and metric labels
    pub fn code_name(&self) -> &'static str {
        match self.code {
            Code::Ok => "ok",
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        Self::new(status.code(), status.message())
    }
}

impl From<tonic::transport::Error> for RpcError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::unavailable(err.to_string())
    }
}

/// The broker operations a worker needs
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fetch one pending activation, `None` when nothing is pending
    async fn get_task(&self, namespace: Option<&str>) -> RpcResult<Option<TaskActivation>>;

    /// Report the outcome of an activation.
    ///
    /// With `fetch_next` set the broker may hand back the next activation in
    /// the same round trip.
    async fn update_task(
        &self,
        task_id: &str,
        status: ActivationStatus,
        fetch_next: Option<FetchNextTask>,
    ) -> RpcResult<Option<TaskActivation>>;
}

#[async_trait]
impl<T: BrokerClient + ?Sized> BrokerClient for std::sync::Arc<T> {
    async fn get_task(&self, namespace: Option<&str>) -> RpcResult<Option<TaskActivation>> {
        (**self).get_task(namespace).await
    }

    async fn update_task(
        &self,
        task_id: &str,
        status: ActivationStatus,
        fetch_next: Option<FetchNextTask>,
    ) -> RpcResult<Option<TaskActivation>> {
        (**self).update_task(task_id, status, fetch_next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RpcError::unavailable("down").is_transient());
        assert!(RpcError::new(Code::DeadlineExceeded, "slow").is_transient());
        assert!(!RpcError::invalid("bad id").is_transient());
        assert!(!RpcError::new(Code::Internal, "boom").is_transient());
    }

    #[test]
    fn test_from_status() {
        let err: RpcError = tonic::Status::unavailable("broker restarting").into();
        assert_eq!(err.code, Code::Unavailable);
        assert_eq!(err.message, "broker restarting");
        assert_eq!(err.code_name(), "unavailable");
    }
}
