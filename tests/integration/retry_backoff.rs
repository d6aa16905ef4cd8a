//! Retry behaviour through the full scheduler path.

use std::sync::Arc;
use std::time::Duration;

use drover::display::TaskEvent;
use drover::retry::{RateLimitConfig, RetryPolicy};
use drover::scheduler::Scheduler;

use crate::fixtures::{collecting_sink, drain, run_config, tasklist, MockBackend, MockStep};

/// Scenario: an execution produces rate-limit-shaped output twice and then
/// succeeds, with max_retries=5.
/// Then the task ends `success` and exactly 2 retry notifications are
/// observed.
#[tokio::test]
async fn test_rate_limited_twice_then_succeeds() {
    let content = "- [ ] Throttled task\n";
    let backend = Arc::new(MockBackend::new().script(
        "Throttled task",
        vec![MockStep::RateLimited, MockStep::RateLimited, MockStep::Succeed],
    ));
    let (list, tasks) = tasklist(content);
    let (sink, rx) = collecting_sink();
    let scheduler = Scheduler::new(backend.clone(), run_config(false, 2), sink, list);

    let summary = scheduler.run(tasks).await.unwrap();
    drop(scheduler);

    assert_eq!(summary.succeeded(), vec!["Throttled task"]);
    assert_eq!(backend.invocations().len(), 3);

    let events = drain(rx);
    let retries: Vec<(u32, Duration)> = events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Retrying { attempt, delay, .. } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect();
    assert_eq!(retries.len(), 2, "expected exactly 2 retry notifications");
    assert_eq!(retries[0].0, 1);
    assert_eq!(retries[1].0, 2);
}

/// Exhausting the retry budget surfaces a failure, not a hang or a crash.
#[tokio::test]
async fn test_rate_limit_exhaustion_fails_task() {
    let content = "- [ ] Hopeless task\n";
    // More rate limits than the budget of 5 retries allows.
    let backend = Arc::new(MockBackend::new().script(
        "Hopeless task",
        vec![MockStep::RateLimited; 10],
    ));
    let (list, tasks) = tasklist(content);
    let (sink, rx) = collecting_sink();
    let scheduler = Scheduler::new(backend.clone(), run_config(false, 1), sink, list);

    let summary = scheduler.run(tasks).await.unwrap();
    drop(scheduler);
    drop(rx);

    assert_eq!(summary.failed(), vec!["Hopeless task"]);
    // Initial attempt plus 5 retries.
    assert_eq!(backend.invocations().len(), 6);
    let error = summary.results[0].error.as_deref().unwrap();
    assert!(error.contains("Retries exhausted"), "got: {}", error);
}

/// A deterministic jitter source yields a reproducible, capped delay
/// sequence end to end.
#[tokio::test]
async fn test_injected_jitter_gives_reproducible_delays() {
    let config = RateLimitConfig::new(
        4,
        Duration::from_millis(2),
        Duration::from_millis(10),
        0.5,
    )
    .unwrap();
    let policy = RetryPolicy::with_jitter(config.clone(), Box::new(|| 0.5));

    let content = "- [ ] Shaky task\n";
    let backend = Arc::new(MockBackend::new().script(
        "Shaky task",
        vec![MockStep::RateLimited, MockStep::RateLimited, MockStep::Succeed],
    ));
    let (list, tasks) = tasklist(content);
    let (sink, rx) = collecting_sink();
    let scheduler = Scheduler::new(backend, run_config(false, 1), sink, list)
        .with_retry_policy(policy);

    scheduler.run(tasks).await.unwrap();
    drop(scheduler);

    let observed: Vec<Duration> = drain(rx)
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Retrying { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();

    // base * 2^n * (1 + 0.5 * 0.5), capped at max_delay.
    let reference = RetryPolicy::with_jitter(config, Box::new(|| 0.5));
    let expected: Vec<Duration> = (0..2).map(|n| reference.delay_for(n, 0.5)).collect();
    assert_eq!(observed, expected);
    assert!(observed.iter().all(|d| *d <= Duration::from_millis(10)));
}
