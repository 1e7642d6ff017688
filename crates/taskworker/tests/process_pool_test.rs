//! Pool of spawned child processes running the compiled worker binary

mod common;

use std::time::{Duration, Instant};
use taskworker::{ChildLauncher, ChildOptions, PoolOptions, ProcessCommand, WorkerPool};
use taskworker_core::{ActivationStatus, FailureReason, ProcessingResult, Serializer};
use taskworker_telemetry::metrics::DEADLINE_EXCEEDED;

fn process_pool(max_task_count: Option<u64>, serializer: Serializer) -> WorkerPool {
    process_pool_of(1, max_task_count, serializer)
}

fn process_pool_of(
    concurrency: usize,
    max_task_count: Option<u64>,
    serializer: Serializer,
) -> WorkerPool {
    common::init();
    let options = ChildOptions {
        max_task_count,
        ..Default::default()
    };
    let command =
        ProcessCommand::new(env!("CARGO_BIN_EXE_taskworker")).child_args(&options, serializer);
    WorkerPool::new(
        ChildLauncher::Process(command),
        PoolOptions {
            concurrency,
            inbound_capacity: 4,
            outbound_capacity: 4,
            poll_interval: Duration::from_millis(20),
            serializer,
        },
    )
    .with_at_most_once(common::at_most_once_gate(&options))
}

fn next_result(pool: &WorkerPool) -> ProcessingResult {
    pool.results()
        .recv_timeout(Duration::from_secs(10))
        .expect("child produced a result")
}

/// Poll until an exited child has been replaced
fn wait_for_respawn(pool: &WorkerPool) -> usize {
    let started = Instant::now();
    loop {
        let reaped = pool.reap_and_respawn().unwrap();
        if reaped > 0 || started.elapsed() > Duration::from_secs(10) {
            return reaped;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_child_retires_after_task_limit() {
    let pool = process_pool(Some(2), Serializer::MessagePack);
    assert_eq!(pool.spawn_children().unwrap(), 1);

    let mut second = common::simple_task();
    second.id = "112".to_string();
    pool.submit(common::simple_task(), Duration::from_secs(1)).unwrap();
    pool.submit(second, Duration::from_secs(1)).unwrap();

    assert_eq!(next_result(&pool), ProcessingResult::complete("111"));
    assert_eq!(next_result(&pool), ProcessingResult::complete("112"));

    assert_eq!(wait_for_respawn(&pool), 1);
    assert_eq!(pool.live_children(), 1);
    assert_eq!(pool.processed(), 2);

    pool.submit(common::simple_task(), Duration::from_secs(1)).unwrap();
    assert_eq!(next_result(&pool).status, ActivationStatus::Complete);

    pool.shutdown(Duration::from_secs(5));
    assert_eq!(pool.live_children(), 0);
}

#[test]
fn test_failure_keeps_child_alive() {
    let pool = process_pool(None, Serializer::Json);
    pool.spawn_children().unwrap();

    pool.submit(common::fail_task(), Duration::from_secs(1)).unwrap();
    let result = next_result(&pool);
    assert_eq!(result.task_id, "333");
    assert_eq!(result.status, ActivationStatus::Failure);

    pool.submit(common::undefined_task(), Duration::from_secs(1)).unwrap();
    assert_eq!(next_result(&pool).failure, Some(FailureReason::UnknownTask));

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(pool.reap(), 0);
    assert_eq!(pool.live_children(), 1);

    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn test_deadline_exceeded_kills_child() {
    let pool = process_pool(None, Serializer::MessagePack);
    pool.spawn_children().unwrap();

    let started = Instant::now();
    pool.submit(common::timed_task(5, Duration::from_secs(1)), Duration::from_secs(1))
        .unwrap();
    let result = next_result(&pool);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.task_id, "777");
    assert_eq!(result.status, ActivationStatus::Failure);
    assert!(result.is_deadline_exceeded());
    // counted by the worker, not the child that ran it
    assert!(DEADLINE_EXCEEDED.with_label_values(&["examples", "examples.timed"]).get() >= 1);

    assert_eq!(wait_for_respawn(&pool), 1);
    assert_eq!(pool.live_children(), 1);

    pool.submit(common::simple_task(), Duration::from_secs(1)).unwrap();
    assert_eq!(next_result(&pool), ProcessingResult::complete("111"));

    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn test_shutdown_stops_idle_children() {
    let pool = process_pool(None, Serializer::MessagePack);
    pool.spawn_children().unwrap();
    assert_eq!(pool.live_children(), 1);

    let started = Instant::now();
    pool.shutdown(Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(pool.live_children(), 0);
}

#[test]
fn test_at_most_once_runs_once_across_children() {
    let pool = process_pool_of(2, Some(1), Serializer::MessagePack);
    assert_eq!(pool.spawn_children().unwrap(), 2);

    pool.submit(common::at_most_once_task(), Duration::from_secs(1)).unwrap();
    pool.submit(common::at_most_once_task(), Duration::from_secs(1)).unwrap();

    assert_eq!(next_result(&pool), ProcessingResult::complete("555"));
    assert!(pool.results().recv_timeout(Duration::from_secs(1)).is_err());
    assert_eq!(pool.inbound_len(), 0);

    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn test_last_result_forwarded_when_child_is_reaped() {
    let pool = process_pool(Some(1), Serializer::Json);
    pool.spawn_children().unwrap();
    pool.submit(common::simple_task(), Duration::from_secs(1)).unwrap();

    let started = Instant::now();
    while pool.reap() == 0 {
        assert!(started.elapsed() < Duration::from_secs(10), "child never retired");
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(
        pool.results().try_recv().ok(),
        Some(ProcessingResult::complete("111"))
    );
    pool.shutdown(Duration::from_secs(5));
}
