//! Conversions between wire messages and core types

use crate::generated::taskbroker::v1 as proto;
use taskworker_core::{ActivationStatus, FetchNextTask, OnAttemptsExceeded, RetryState, TaskActivation};

impl From<proto::OnAttemptsExceeded> for OnAttemptsExceeded {
    fn from(value: proto::OnAttemptsExceeded) -> Self {
        match value {
            proto::OnAttemptsExceeded::Unspecified => OnAttemptsExceeded::Unspecified,
            proto::OnAttemptsExceeded::Discard => OnAttemptsExceeded::Discard,
            proto::OnAttemptsExceeded::Deadletter => OnAttemptsExceeded::Deadletter,
        }
    }
}

impl From<OnAttemptsExceeded> for proto::OnAttemptsExceeded {
    fn from(value: OnAttemptsExceeded) -> Self {
        match value {
            OnAttemptsExceeded::Unspecified => proto::OnAttemptsExceeded::Unspecified,
            OnAttemptsExceeded::Discard => proto::OnAttemptsExceeded::Discard,
            OnAttemptsExceeded::Deadletter => proto::OnAttemptsExceeded::Deadletter,
        }
    }
}

impl From<proto::RetryState> for RetryState {
    fn from(state: proto::RetryState) -> Self {
        let on_attempts_exceeded = proto::OnAttemptsExceeded::try_from(state.on_attempts_exceeded)
            .unwrap_or(proto::OnAttemptsExceeded::Unspecified);
        RetryState {
            attempts: state.attempts,
            max_attempts: state.max_attempts,
            on_attempts_exceeded: on_attempts_exceeded.into(),
        }
    }
}

impl From<RetryState> for proto::RetryState {
    fn from(state: RetryState) -> Self {
        proto::RetryState {
            attempts: state.attempts,
            max_attempts: state.max_attempts,
            on_attempts_exceeded: proto::OnAttemptsExceeded::from(state.on_attempts_exceeded) as i32,
        }
    }
}

impl From<proto::TaskActivation> for TaskActivation {
    fn from(activation: proto::TaskActivation) -> Self {
        TaskActivation {
            id: activation.id,
            namespace: activation.namespace,
            taskname: activation.taskname,
            parameters: activation.parameters,
            headers: activation.headers,
            processing_deadline_duration: activation.processing_deadline_duration,
            retry_state: activation.retry_state.map(Into::into),
        }
    }
}

impl From<TaskActivation> for proto::TaskActivation {
    fn from(activation: TaskActivation) -> Self {
        proto::TaskActivation {
            id: activation.id,
            namespace: activation.namespace,
            taskname: activation.taskname,
            parameters: activation.parameters,
            headers: activation.headers,
            retry_state: activation.retry_state.map(Into::into),
            processing_deadline_duration: activation.processing_deadline_duration,
        }
    }
}

impl From<FetchNextTask> for proto::FetchNextTask {
    fn from(fetch: FetchNextTask) -> Self {
        proto::FetchNextTask {
            namespace: fetch.namespace,
        }
    }
}

pub(crate) fn status_to_proto(status: ActivationStatus) -> proto::TaskActivationStatus {
    match status {
        ActivationStatus::Failure => proto::TaskActivationStatus::Failure,
        ActivationStatus::Retry => proto::TaskActivationStatus::Retry,
        ActivationStatus::Complete => proto::TaskActivationStatus::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_from_wire() {
        let wire = proto::TaskActivation {
            id: "abc".into(),
            namespace: "examples".into(),
            taskname: "examples.retry_task".into(),
            parameters: r#"{"args": [], "kwargs": {}}"#.into(),
            headers: Default::default(),
            retry_state: Some(proto::RetryState {
                attempts: 1,
                max_attempts: 2,
                on_attempts_exceeded: proto::OnAttemptsExceeded::Discard as i32,
            }),
            processing_deadline_duration: 5,
        };

        let activation: TaskActivation = wire.into();
        let state = activation.retry_state.unwrap();
        assert_eq!(state.on_attempts_exceeded, OnAttemptsExceeded::Discard);
        assert!(state.attempts_exhausted());
        assert_eq!(activation.processing_deadline_duration, 5);
    }

    #[test]
    fn test_unknown_policy_falls_back_to_unspecified() {
        let state: RetryState = proto::RetryState {
            attempts: 0,
            max_attempts: 3,
            on_attempts_exceeded: 42,
        }
        .into();
        assert_eq!(state.on_attempts_exceeded, OnAttemptsExceeded::Unspecified);
    }

    #[test]
    fn test_status_values_match_core() {
        for status in [
            ActivationStatus::Failure,
            ActivationStatus::Retry,
            ActivationStatus::Complete,
        ] {
            assert_eq!(status_to_proto(status) as i32, status.as_proto());
        }
    }
}
