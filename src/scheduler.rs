//! Two-phase task scheduler.
//!
//! Fundamental tasks run first, one at a time, in dependency order.
//! Independent tasks then run on a bounded worker pool. Workers report
//! through the event pipeline and never share mutable state beyond an
//! explicit [`WorkerContext`]: a write-once cancellation flag, the shared
//! backend, the retry policy, and the task-list artifact behind a mutex.
//!
//! Hard invariant: every dispatched task produces exactly one terminal
//! event, even when an execution panics. Workers convert everything they
//! catch into a `failed` result rather than crashing the run.

use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::{AgentBackend, ExecRequest};
use crate::config::RunConfig;
use crate::display::{EventSink, TaskEvent, TaskOutcome};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::tasklist::{Task, TaskCategory, TaskList};
use crate::{dlog, dlog_debug, dlog_error};

/// Longest error excerpt surfaced to the display and summary.
const ERROR_EXCERPT_LEN: usize = 200;

/// Result of one dispatched task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub name: String,
    pub outcome: TaskOutcome,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Final report for one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub results: Vec<TaskResult>,
}

impl RunSummary {
    fn names_with(&self, outcome: TaskOutcome) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.outcome == outcome)
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.names_with(TaskOutcome::Success)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_with(TaskOutcome::Failed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names_with(TaskOutcome::Skipped)
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed().len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped().len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_count() == 0 && self.skipped_count() == 0
    }
}

/// Everything a worker needs, passed explicitly rather than reached for
/// globally.
struct WorkerContext {
    backend: Arc<dyn AgentBackend>,
    policy: Arc<RetryPolicy>,
    events: EventSink,
    tasklist: Arc<Mutex<TaskList>>,
    cancelled: Arc<AtomicBool>,
    task_timeout: Option<Duration>,
    fail_fast: bool,
}

/// Drives a task list through the backend in two phases.
pub struct Scheduler {
    backend: Arc<dyn AgentBackend>,
    config: RunConfig,
    policy: Arc<RetryPolicy>,
    events: EventSink,
    tasklist: Arc<Mutex<TaskList>>,
}

impl Scheduler {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        config: RunConfig,
        events: EventSink,
        tasklist: Arc<Mutex<TaskList>>,
    ) -> Self {
        let policy = Arc::new(RetryPolicy::new(config.rate_limit.clone()));
        Self {
            backend,
            config,
            policy,
            events,
            tasklist,
        }
    }

    /// Swap in a custom retry policy (deterministic jitter in tests).
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Execute the given pending tasks. Indices into `tasks` address the
    /// display records.
    pub async fn run(&self, tasks: Vec<Task>) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        let mut fundamentals: Vec<(usize, Task)> = Vec::new();
        let mut independents: Vec<(usize, Task)> = Vec::new();
        for (index, task) in tasks.into_iter().enumerate() {
            match task.category {
                TaskCategory::Fundamental => fundamentals.push((index, task)),
                TaskCategory::Independent => independents.push((index, task)),
            }
        }
        // Explicit orders first, then source position. Stable by
        // construction: the key is total.
        fundamentals.sort_by_key(|(_, t)| t.sort_key());

        let ctx = Arc::new(WorkerContext {
            backend: self.backend.clone(),
            policy: self.policy.clone(),
            events: self.events.clone(),
            tasklist: self.tasklist.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
            task_timeout: self.config.task_timeout,
            fail_fast: self.config.fail_fast,
        });

        // Phase 1: fundamentals, strictly ordered, one at a time.
        dlog!(
            "Phase 1: {} fundamental task(s), {} independent task(s) queued",
            fundamentals.len(),
            independents.len()
        );
        let mut aborted = false;
        let mut fundamentals = VecDeque::from(fundamentals);
        while let Some((index, task)) = fundamentals.pop_front() {
            let result = run_guarded(ctx.clone(), index, task).await;
            let failed = result.outcome == TaskOutcome::Failed;
            summary.results.push(result);
            if failed && self.config.fail_fast {
                dlog!("Fail-fast: aborting after fundamental task failure");
                aborted = true;
                break;
            }
        }

        if aborted {
            // Skip everything that never got dispatched, fundamentals and
            // independents alike. Each still gets its terminal event.
            for (index, task) in fundamentals.into_iter().chain(independents) {
                summary.results.push(skip_task(&ctx, index, &task));
            }
            self.backend.close();
            return Ok(summary);
        }

        // Phase 2: independents on the worker pool.
        let workers = self.worker_count(independents.len());
        dlog!("Phase 2: dispatching on {} worker(s)", workers);
        let queue = Arc::new(Mutex::new(VecDeque::from(independents)));
        let handles: Vec<_> = (0..workers)
            .map(|_| tokio::spawn(worker_loop(ctx.clone(), queue.clone())))
            .collect();
        for joined in join_all(handles).await {
            match joined {
                Ok(results) => summary.results.extend(results),
                // A worker task dying whole is a bug, but the tasks it
                // already reported stay reported; nothing is left without
                // a terminal event because run_guarded posts before
                // returning.
                Err(e) => dlog_error!("Worker join error: {}", e),
            }
        }

        self.backend.close();
        Ok(summary)
    }

    fn worker_count(&self, queued: usize) -> usize {
        let cap = if self.backend.supports_parallel_execution() {
            self.config.max_parallel_tasks
        } else {
            dlog!(
                "{} does not support parallel execution, using one worker",
                self.backend.name()
            );
            1
        };
        cap.min(queued).max(1)
    }
}

fn skip_task(ctx: &WorkerContext, index: usize, task: &Task) -> TaskResult {
    ctx.events.post_event(TaskEvent::Finished {
        index,
        outcome: TaskOutcome::Skipped,
        duration: Duration::ZERO,
        error: None,
    });
    TaskResult {
        name: task.name.clone(),
        outcome: TaskOutcome::Skipped,
        duration: Duration::ZERO,
        error: None,
    }
}

/// Pop-and-run loop for one Phase-2 worker.
async fn worker_loop(
    ctx: Arc<WorkerContext>,
    queue: Arc<Mutex<VecDeque<(usize, Task)>>>,
) -> Vec<TaskResult> {
    let mut results = Vec::new();
    loop {
        let item = ctx.queue_pop(&queue);
        let Some((index, task)) = item else {
            break;
        };
        // Cooperative cancellation, checked before a task starts. Running
        // siblings are left to finish and record their real result.
        if ctx.cancelled.load(Ordering::SeqCst) {
            results.push(skip_task(&ctx, index, &task));
            continue;
        }
        let result = run_guarded(ctx.clone(), index, task).await;
        if result.outcome == TaskOutcome::Failed && ctx.fail_fast {
            ctx.cancelled.store(true, Ordering::SeqCst);
        }
        results.push(result);
    }
    results
}

impl WorkerContext {
    fn queue_pop(
        &self,
        queue: &Mutex<VecDeque<(usize, Task)>>,
    ) -> Option<(usize, Task)> {
        queue.lock().ok()?.pop_front()
    }
}

/// Run one task, converting a panicking execution into a `failed` result so
/// the terminal-event invariant holds no matter what.
async fn run_guarded(ctx: Arc<WorkerContext>, index: usize, task: Task) -> TaskResult {
    let name = task.name.clone();
    let handle = tokio::spawn(execute_task(ctx.clone(), index, task));
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            let error = excerpt(&format!("task execution crashed: {}", e));
            dlog_error!("{}: {}", name, error);
            ctx.events.post_event(TaskEvent::Finished {
                index,
                outcome: TaskOutcome::Failed,
                duration: Duration::ZERO,
                error: Some(error.clone()),
            });
            TaskResult {
                name,
                outcome: TaskOutcome::Failed,
                duration: Duration::ZERO,
                error: Some(error),
            }
        }
    }
}

/// Execute one task through the retry policy and report its terminal event.
async fn execute_task(ctx: Arc<WorkerContext>, index: usize, task: Task) -> TaskResult {
    ctx.events.post_event(TaskEvent::Started { index });
    let started = Instant::now();

    let request = Arc::new(
        {
            let mut r = ExecRequest::new(task.name.clone()).isolated();
            r.timeout = ctx.task_timeout;
            r
        },
    );

    let events = ctx.events.clone();
    let backend = ctx.backend.clone();
    let attempt_request = request.clone();
    let outcome = ctx
        .policy
        .run(
            move || {
                let backend = backend.clone();
                let events = events.clone();
                let request = attempt_request.clone();
                async move {
                    let on_line = move |line: &str| {
                        events.post_event(TaskEvent::OutputLine {
                            index,
                            line: line.to_string(),
                        });
                    };
                    let result = backend.run_with_callback(&request, &on_line).await?;
                    if result.success {
                        Ok(())
                    } else if backend.detect_rate_limit(&result.output) {
                        Err(crate::Error::RateLimited(excerpt(&result.output)))
                    } else {
                        Err(crate::Error::AgentFailed(excerpt(&result.output)))
                    }
                }
            },
            |attempt, delay, _err| {
                ctx.events.post_event(TaskEvent::Retrying {
                    index,
                    attempt,
                    delay,
                });
            },
        )
        .await;

    let duration = started.elapsed();
    let (terminal, error) = match outcome {
        Ok(()) => {
            // Persist success. A failed write must not un-succeed the
            // task; it is logged and the next run re-marks it.
            match ctx.tasklist.lock() {
                Ok(mut list) => {
                    if let Err(e) = list.mark_complete(&task.name) {
                        dlog_error!("Could not mark '{}' complete: {}", task.name, e);
                    }
                }
                Err(_) => dlog_error!("Task list lock poisoned, skipping mark-complete"),
            }
            (TaskOutcome::Success, None)
        }
        Err(e) => {
            dlog_debug!("Task '{}' failed: {}", task.name, e);
            (TaskOutcome::Failed, Some(excerpt(&e.to_string())))
        }
    };

    ctx.events.post_event(TaskEvent::Finished {
        index,
        outcome: terminal,
        duration,
        error: error.clone(),
    });
    TaskResult {
        name: task.name,
        outcome: terminal,
        duration,
        error,
    }
}

/// Trim an error or output blob down to its tail for display.
fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= ERROR_EXCERPT_LEN {
        return trimmed.to_string();
    }
    let start = trimmed
        .char_indices()
        .rev()
        .take(ERROR_EXCERPT_LEN)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("...{}", &trimmed[start..])
}
