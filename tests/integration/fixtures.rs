//! Test fixtures for integration tests.
//!
//! Provides:
//! - A scripted [`MockBackend`] that satisfies the capability contract
//! - Event-collecting sinks for asserting on the lifecycle stream
//! - Run-config and task-list builders

use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drover::backend::{AgentBackend, BackendKind, ExecOutcome, ExecRequest, OutputCallback};
use drover::config::{Config, Overrides, RunConfig};
use drover::display::{EventSink, TaskEvent, TaskOutcome};
use drover::tasklist::{Task, TaskList};
use drover::Result;

/// One scripted response for a mock invocation.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Report success.
    Succeed,
    /// Report failure with the given output.
    Fail(&'static str),
    /// Report rate-limit-shaped failure output.
    RateLimited,
    /// Panic mid-execution, as a stand-in for an unexpected crash.
    Panic,
}

/// Scripted agent backend.
///
/// Satisfies the capability contract with no process and no network.
/// Scripts are consumed one step per invocation; unscripted tasks succeed.
/// Records invocation order, per-invocation time spans, and the peak
/// number of concurrent invocations.
pub struct MockBackend {
    scripts: Mutex<HashMap<String, VecDeque<MockStep>>>,
    invocations: Mutex<Vec<String>>,
    spans: Mutex<Vec<(String, Instant, Instant)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    latency: Duration,
    task_latency: Mutex<HashMap<String, Duration>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            spans: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            latency: Duration::from_millis(10),
            task_latency: Mutex::new(HashMap::new()),
        }
    }

    /// Simulated per-invocation latency (external-process stand-in).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Override the latency for one task, e.g. to make a failure land
    /// deterministically before a sibling finishes.
    pub fn with_task_latency(self, task: &str, latency: Duration) -> Self {
        self.task_latency
            .lock()
            .unwrap()
            .insert(task.to_string(), latency);
        self
    }

    pub fn script(self, task: &str, steps: Vec<MockStep>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), steps.into());
        self
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn spans(&self) -> Vec<(String, Instant, Instant)> {
        self.spans.lock().unwrap().clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    async fn run_with_callback(
        &self,
        request: &ExecRequest,
        on_line: OutputCallback<'_>,
    ) -> Result<ExecOutcome> {
        let start = Instant::now();
        self.invocations.lock().unwrap().push(request.prompt.clone());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let latency = self
            .task_latency
            .lock()
            .unwrap()
            .get(&request.prompt)
            .copied()
            .unwrap_or(self.latency);
        tokio::time::sleep(latency).await;

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.prompt)
            .and_then(|s| s.pop_front())
            .unwrap_or(MockStep::Succeed);

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.spans
            .lock()
            .unwrap()
            .push((request.prompt.clone(), start, Instant::now()));

        match step {
            MockStep::Succeed => {
                on_line(&format!("completed {}", request.prompt));
                Ok(ExecOutcome {
                    success: true,
                    output: format!("completed {}\n", request.prompt),
                })
            }
            MockStep::Fail(output) => Ok(ExecOutcome {
                success: false,
                output: output.to_string(),
            }),
            MockStep::RateLimited => Ok(ExecOutcome {
                success: false,
                output: "HTTP 429: rate limit reached, slow down".to_string(),
            }),
            MockStep::Panic => panic!("scripted crash in {}", request.prompt),
        }
    }

    async fn run_quiet(&self, request: &ExecRequest) -> Result<String> {
        Ok(format!("completed {}", request.prompt))
    }

    fn check_installed(&self) -> (bool, String) {
        (true, "mock backend".to_string())
    }

    fn detect_rate_limit(&self, output: &str) -> bool {
        output.contains("429") || output.to_lowercase().contains("rate limit")
    }
}

/// An event sink plus the receiver collecting everything posted to it.
pub fn collecting_sink() -> (EventSink, Receiver<TaskEvent>) {
    let (tx, rx) = unbounded();
    (EventSink::new(tx), rx)
}

/// Drain all collected events (call after every sender is gone).
pub fn drain(rx: Receiver<TaskEvent>) -> Vec<TaskEvent> {
    rx.try_iter().collect()
}

/// The terminal events among `events`, as `(index, outcome)` pairs.
pub fn terminal_events(events: &[TaskEvent]) -> Vec<(usize, TaskOutcome)> {
    events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Finished { index, outcome, .. } => Some((*index, *outcome)),
            _ => None,
        })
        .collect()
}

/// Indices that received a `Started` event.
pub fn started_indices(events: &[TaskEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Started { index } => Some(*index),
            _ => None,
        })
        .collect()
}

/// Parse a task list and return it with its pending tasks.
pub fn tasklist(content: &str) -> (Arc<Mutex<TaskList>>, Vec<Task>) {
    let list = TaskList::parse_str(content).unwrap();
    let tasks: Vec<Task> = list.pending().cloned().collect();
    (Arc::new(Mutex::new(list)), tasks)
}

/// A run config with fast retry delays suitable for tests.
pub fn run_config(fail_fast: bool, parallel: usize) -> RunConfig {
    let mut config = Config::default();
    config.max_parallel_tasks = Some(parallel);
    config.fail_fast = fail_fast;
    config.rate_limit.max_retries = 5;
    config.rate_limit.base_delay_secs = 0.001;
    config.rate_limit.max_delay_secs = 0.01;
    config.resolve(&Overrides::default()).unwrap()
}
