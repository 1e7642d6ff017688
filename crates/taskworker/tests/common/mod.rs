//! Common test utilities and fixtures

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;
use taskworker::{
    register_builtin_tasks, AtMostOnceGate, ChildOptions, MemoryAtMostOnceStore, TaskRegistry,
};
use taskworker_core::{
    OnAttemptsExceeded, RetryState, TaskActivation, MONITOR_CHECK_IN_ID_HEADER,
    MONITOR_SLUG_HEADER,
};

static INIT: Once = Once::new();

/// Initialize test environment (logging, etc.)
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("taskworker=debug")
            .try_init();
    });
}

/// Registry with the built-in `examples` tasks
pub fn registry() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    register_builtin_tasks(&mut registry).expect("builtin tasks register");
    Arc::new(registry)
}

/// At-most-once record shared by every child of one pool
pub fn at_most_once_gate(options: &ChildOptions) -> Arc<AtMostOnceGate> {
    Arc::new(AtMostOnceGate::new(
        registry(),
        Arc::new(MemoryAtMostOnceStore::new()),
        options.clone(),
    ))
}

fn activation(id: &str, namespace: &str, taskname: &str) -> TaskActivation {
    TaskActivation::new(id, namespace, taskname)
        .parameters(r#"{"args": [], "kwargs": {}}"#)
        .deadline(Duration::from_secs(2))
}

pub fn simple_task() -> TaskActivation {
    activation("111", "examples", "examples.simple_task")
}

pub fn retry_task() -> TaskActivation {
    activation("222", "examples", "examples.retry_task").retry_state(
        RetryState::new(3).on_attempts_exceeded(OnAttemptsExceeded::Discard),
    )
}

pub fn fail_task() -> TaskActivation {
    activation("333", "examples", "examples.fail_task")
}

pub fn undefined_task() -> TaskActivation {
    activation("444", "lolnope", "total.rubbish")
}

pub fn at_most_once_task() -> TaskActivation {
    activation("555", "examples", "examples.at_most_once")
}

/// Last allowed attempt of a task that asks for a retry
pub fn retry_state_task() -> TaskActivation {
    activation("654", "examples", "examples.retry_state").retry_state(RetryState {
        attempts: 1,
        max_attempts: 2,
        on_attempts_exceeded: OnAttemptsExceeded::Discard,
    })
}

/// Sleeps `seconds` with a deadline of `deadline`
pub fn timed_task(seconds: u64, deadline: Duration) -> TaskActivation {
    TaskActivation::new("777", "examples", "examples.timed")
        .parameters(format!(r#"{{"args": [{}], "kwargs": {{}}}}"#, seconds))
        .deadline(deadline)
}

pub fn scheduled_task() -> TaskActivation {
    simple_task()
        .header(MONITOR_SLUG_HEADER, "simple-task")
        .header(MONITOR_CHECK_IN_ID_HEADER, "abc123")
}
