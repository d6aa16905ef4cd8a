//! Event pipeline and live display.
//!
//! Workers never touch display state directly. They post [`TaskEvent`]s
//! through a thread-safe [`EventSink`] onto a channel, and one dedicated
//! rendering thread drains that channel on a bounded poll, applies the
//! events to per-task [`RunRecord`]s, and repaints once per full drain.
//! Sends never block, so a slow terminal cannot stall a worker.

use chrono::{DateTime, Local};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use crossterm::style::Stylize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::tasklist::Task;
use crate::{dlog_debug, Error, Result};

/// How long the rendering thread waits for an event before re-polling.
const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Terminal outcome of one dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Success => write!(f, "success"),
            TaskOutcome::Failed => write!(f, "failed"),
            TaskOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// Display-side status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Skipped
        )
    }
}

impl From<TaskOutcome> for RunStatus {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Success => RunStatus::Success,
            TaskOutcome::Failed => RunStatus::Failed,
            TaskOutcome::Skipped => RunStatus::Skipped,
        }
    }
}

/// Lifecycle events posted by workers, addressed by task index.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started {
        index: usize,
    },
    OutputLine {
        index: usize,
        line: String,
    },
    Retrying {
        index: usize,
        attempt: u32,
        delay: Duration,
    },
    Finished {
        index: usize,
        outcome: TaskOutcome,
        duration: Duration,
        error: Option<String>,
    },
}

/// Thread-safe handle workers use to post events.
///
/// The only display operation that happens off the rendering thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<TaskEvent>,
}

impl EventSink {
    /// Wrap a raw channel sender. External presentation layers use this to
    /// consume the lifecycle stream themselves instead of the built-in
    /// rendering thread.
    pub fn new(tx: Sender<TaskEvent>) -> Self {
        Self { tx }
    }

    pub fn post_event(&self, event: TaskEvent) {
        // A disconnected receiver means the display is already gone at
        // shutdown; dropping the event is the right thing then.
        let _ = self.tx.send(event);
    }
}

/// Per-task display state, owned and mutated only by the rendering thread.
#[derive(Debug)]
pub struct RunRecord {
    pub name: String,
    pub group_label: Option<String>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
    sink: Option<BufWriter<File>>,
    sink_path: Option<PathBuf>,
}

impl RunRecord {
    fn new(task: &Task, sink_path: Option<PathBuf>) -> Self {
        Self {
            name: task.name.clone(),
            group_label: task.group_label.clone(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            duration: None,
            error: None,
            sink: None,
            sink_path,
        }
    }

    /// Close the output-log sink. Failures are ignored: losing a log line
    /// must never change a task's outcome.
    fn close_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.flush();
        }
    }
}

/// The live display: a rendering thread plus the channel feeding it.
pub struct LiveDisplay {
    thread: JoinHandle<Vec<RunRecord>>,
}

impl LiveDisplay {
    /// Spawn the rendering thread for the given tasks.
    ///
    /// `log_root`, when set, receives one output-log file per task.
    /// `echo` controls whether status lines are painted to stdout (tests
    /// turn it off).
    pub fn spawn(tasks: &[Task], log_root: Option<PathBuf>, echo: bool) -> Result<(EventSink, Self)> {
        if let Some(root) = &log_root {
            std::fs::create_dir_all(root)?;
        }
        let records: Vec<RunRecord> = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| {
                let sink_path = log_root
                    .as_ref()
                    .map(|root| root.join(format!("{:02}-{}.log", i, slug(&task.name))));
                RunRecord::new(task, sink_path)
            })
            .collect();

        let (tx, rx) = unbounded();
        let thread = std::thread::Builder::new()
            .name("drover-render".to_string())
            .spawn(move || render_loop(rx, records, echo))
            .map_err(Error::Io)?;

        Ok((EventSink { tx }, Self { thread }))
    }

    /// Wait for the rendering thread to drain and exit, returning the final
    /// records. Call after every sender has been dropped.
    pub fn join(self) -> Result<Vec<RunRecord>> {
        self.thread
            .join()
            .map_err(|_| Error::TaskJoin("rendering thread panicked".to_string()))
    }
}

fn slug(name: &str) -> String {
    let mut out: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    out.truncate(40);
    out.trim_matches('-').to_string()
}

fn render_loop(rx: Receiver<TaskEvent>, mut records: Vec<RunRecord>, echo: bool) -> Vec<RunRecord> {
    let mut paint_buf: Vec<String> = Vec::new();
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                apply(&mut records, event, &mut paint_buf);
                // Drain everything queued before painting once.
                while let Ok(event) = rx.try_recv() {
                    apply(&mut records, event, &mut paint_buf);
                }
                if echo && !paint_buf.is_empty() {
                    let mut stdout = std::io::stdout().lock();
                    for line in paint_buf.drain(..) {
                        let _ = writeln!(stdout, "{}", line);
                    }
                    let _ = stdout.flush();
                } else {
                    paint_buf.clear();
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // All senders gone; close any sink left open.
    for record in &mut records {
        record.close_sink();
    }
    records
}

/// Apply one event to its RunRecord, queueing paint lines.
fn apply(records: &mut [RunRecord], event: TaskEvent, paint: &mut Vec<String>) {
    let index = match &event {
        TaskEvent::Started { index }
        | TaskEvent::OutputLine { index, .. }
        | TaskEvent::Retrying { index, .. }
        | TaskEvent::Finished { index, .. } => *index,
    };
    let Some(record) = records.get_mut(index) else {
        dlog_debug!("Dropping event for unknown task index {}", index);
        return;
    };

    match event {
        TaskEvent::Started { .. } => {
            if record.status != RunStatus::Pending {
                return;
            }
            record.status = RunStatus::Running;
            record.started_at = Some(Local::now());
            if let Some(path) = &record.sink_path {
                match File::create(path) {
                    Ok(file) => record.sink = Some(BufWriter::new(file)),
                    Err(e) => {
                        dlog_debug!("Could not open output log {}: {}", path.display(), e)
                    }
                }
            }
            paint.push(format!("{} {}", "▶".blue(), record.name.as_str().bold()));
        }
        TaskEvent::OutputLine { line, .. } => {
            if let Some(sink) = &mut record.sink {
                let _ = writeln!(sink, "{}", line);
            }
            paint.push(format!("  {} {}", format!("{} │", record.name).dim(), line));
        }
        TaskEvent::Retrying { attempt, delay, .. } => {
            paint.push(format!(
                "{} {}: retry {} in {:.1}s",
                "↻".yellow(),
                record.name,
                attempt,
                delay.as_secs_f64()
            ));
        }
        TaskEvent::Finished {
            outcome,
            duration,
            error,
            ..
        } => {
            if record.status.is_terminal() {
                // Exactly one terminal status per task; late duplicates are
                // dropped.
                return;
            }
            record.status = outcome.into();
            record.finished_at = Some(Local::now());
            record.duration = Some(duration);
            record.error = error.clone();
            if let Some(err) = &error {
                if let Some(sink) = &mut record.sink {
                    let _ = writeln!(sink, "error: {}", err);
                }
            }
            record.close_sink();
            paint.push(match outcome {
                TaskOutcome::Success => format!(
                    "{} {} ({:.1}s)",
                    "✔".green(),
                    record.name,
                    duration.as_secs_f64()
                ),
                TaskOutcome::Failed => format!(
                    "{} {} ({:.1}s): {}",
                    "✘".red(),
                    record.name,
                    duration.as_secs_f64(),
                    error.as_deref().unwrap_or("unknown error")
                ),
                TaskOutcome::Skipped => {
                    format!("{} {} (skipped)", "⊘".dark_grey(), record.name)
                }
            });
        }
    }
}
