//! Built-in tasks in the `examples` namespace

use crate::context::TaskContext;
use crate::registry::{RetryPolicy, TaskDefinition, TaskError, TaskRegistry};
use std::time::Duration;
use taskworker_core::{OnAttemptsExceeded, Parameters, Result};
use tracing::info;

pub const NAMESPACE: &str = "examples";

fn simple_task(ctx: &TaskContext, _params: &Parameters) -> std::result::Result<(), TaskError> {
    info!(task_id = %ctx.id(), "simple_task complete");
    Ok(())
}

fn retry_task(ctx: &TaskContext, _params: &Parameters) -> std::result::Result<(), TaskError> {
    Err(ctx.retry())
}

fn fail_task(_ctx: &TaskContext, _params: &Parameters) -> std::result::Result<(), TaskError> {
    Err(TaskError::failed("nope"))
}

fn at_most_once_task(ctx: &TaskContext, _params: &Parameters) -> std::result::Result<(), TaskError> {
    info!(task_id = %ctx.id(), "at_most_once ran");
    Ok(())
}

/// Sleeps for `args[0]` seconds
fn timed_task(_ctx: &TaskContext, params: &Parameters) -> std::result::Result<(), TaskError> {
    let seconds: f64 = params.arg(0).map_err(TaskError::failed)?.unwrap_or(0.0);
    std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
    Ok(())
}

/// Asks for a retry and treats running out of retries as success
fn retry_state_task(ctx: &TaskContext, _params: &Parameters) -> std::result::Result<(), TaskError> {
    match ctx.retry() {
        TaskError::NoRetriesRemaining => {
            info!(
                task_id = %ctx.id(),
                retry_state = ?ctx.retry_state(),
                "No retries remaining, giving up"
            );
            Ok(())
        }
        err => Err(err),
    }
}

fn panic_task(_ctx: &TaskContext, _params: &Parameters) -> std::result::Result<(), TaskError> {
    panic!("panic_task always panics");
}

/// Register the built-in tasks
pub fn register_builtin_tasks(registry: &mut TaskRegistry) -> Result<()> {
    registry.register(TaskDefinition::new(NAMESPACE, "examples.simple_task", simple_task))?;
    registry.register(
        TaskDefinition::new(NAMESPACE, "examples.retry_task", retry_task)
            .retry(RetryPolicy::new(2)),
    )?;
    registry.register(TaskDefinition::new(NAMESPACE, "examples.fail_task", fail_task))?;
    registry.register(
        TaskDefinition::new(NAMESPACE, "examples.at_most_once", at_most_once_task)
            .at_most_once(true),
    )?;
    registry.register(TaskDefinition::new(NAMESPACE, "examples.timed", timed_task))?;
    registry.register(
        TaskDefinition::new(NAMESPACE, "examples.retry_state", retry_state_task)
            .retry(RetryPolicy::new(2).times_exceeded(OnAttemptsExceeded::Discard)),
    )?;
    registry.register(TaskDefinition::new(NAMESPACE, "examples.panic_task", panic_task))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_register_once() {
        let mut registry = TaskRegistry::new();
        register_builtin_tasks(&mut registry).unwrap();
        assert_eq!(registry.len(), 7);
        assert!(registry
            .lookup(NAMESPACE, "examples.at_most_once")
            .map(|t| t.is_at_most_once())
            .unwrap_or(false));

        assert!(register_builtin_tasks(&mut registry).is_err());
    }
}
