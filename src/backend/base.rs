//! Shared backend machinery: subagent definition parsing and the
//! timeout-enforcing streaming process runner.
//!
//! Adapters compose these helpers instead of inheriting them, keeping the
//! public contract purely trait-based.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{ExecOutcome, OutputCallback};
use crate::error::{Error, Result};
use crate::{dlog_debug, dlog_warn};

/// Grace period between the first kill signal and the forced follow-up.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Bound on draining pipes and joining the watchdog after EOF. Killed
/// children may leave grandchildren holding the pipes open; those must not
/// hang the engine.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Parsed front-matter of a subagent definition file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptMetadata {
    /// Model requested by the definition.
    pub model: Option<String>,
    /// Sampling temperature requested by the definition.
    pub temperature: Option<f64>,
}

/// A subagent definition: front-matter metadata plus the prompt body.
#[derive(Debug, Clone)]
pub struct SubagentDefinition {
    pub name: String,
    pub metadata: PromptMetadata,
    pub body: String,
}

/// Split front-matter from a definition file's content.
///
/// The block must open the file with a `---` line and close with another.
/// Only `key: value` lines are understood and only `model` and
/// `temperature` are kept; everything else is ignored. Malformed blocks
/// degrade to empty metadata with the whole content as body — a definition
/// file can slow us down but never stop us, and it is parsed as plain data,
/// never evaluated.
pub fn parse_front_matter(content: &str) -> (PromptMetadata, String) {
    let mut lines = content.lines();
    match lines.next() {
        Some(first) if first.trim() == "---" => {}
        _ => return (PromptMetadata::default(), content.to_string()),
    }

    let mut metadata = PromptMetadata::default();
    let mut consumed = 0usize;
    let mut closed = false;
    for line in lines {
        consumed += 1;
        if line.trim() == "---" {
            closed = true;
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "model" if !value.is_empty() => metadata.model = Some(value.to_string()),
            "temperature" => match value.parse::<f64>() {
                Ok(t) => metadata.temperature = Some(t),
                Err(_) => {
                    dlog_debug!("Ignoring unparseable temperature: {:?}", value);
                }
            },
            _ => {}
        }
    }

    if !closed {
        dlog_debug!("Front-matter block never closed, treating as plain content");
        return (PromptMetadata::default(), content.to_string());
    }

    // Skip the opener, the consumed block, and one optional blank line.
    let body: String = content
        .lines()
        .skip(1 + consumed)
        .collect::<Vec<_>>()
        .join("\n");
    (metadata, body.trim_start_matches('\n').to_string())
}

/// Load a subagent definition by symbolic name from the agents directory.
pub fn load_subagent(agents_dir: &Path, name: &str) -> Result<SubagentDefinition> {
    let path = agents_dir.join(format!("{}.md", name));
    let content = std::fs::read_to_string(&path).map_err(|e| {
        Error::Validation(format!(
            "subagent '{}' not found at {}: {}",
            name,
            path.display(),
            e
        ))
    })?;
    let (metadata, body) = parse_front_matter(&content);
    dlog_debug!(
        "Loaded subagent '{}' (model={:?}, temperature={:?})",
        name,
        metadata.model,
        metadata.temperature
    );
    Ok(SubagentDefinition {
        name: name.to_string(),
        metadata,
        body,
    })
}

/// Resolve the model for one invocation.
///
/// Precedence: explicit per-call override, then the subagent front-matter,
/// then the backend's configured default. First non-empty wins.
pub fn resolve_model(
    explicit: Option<&str>,
    metadata: Option<&PromptMetadata>,
    default: Option<&str>,
) -> Option<String> {
    explicit
        .filter(|m| !m.trim().is_empty())
        .or_else(|| {
            metadata
                .and_then(|m| m.model.as_deref())
                .filter(|m| !m.trim().is_empty())
        })
        .or_else(|| default.filter(|m| !m.trim().is_empty()))
        .map(|m| m.to_string())
}

enum WatchdogVerdict {
    Completed(std::process::ExitStatus),
    TimedOut,
}

/// Run an external command, streaming stdout line-by-line.
///
/// The child gets no stdin. Each stdout line is handed to `on_line`
/// (trimmed) as it is produced, and accumulated raw into the returned
/// output together with stderr. When `timeout` is set, a watchdog task
/// owns the child and races a cancellable wait against the deadline: the
/// reader cancels it at EOF, and if the deadline wins instead the child is
/// killed — one signal, a grace period, then a forced second kill — and the
/// call fails with [`Error::Timeout`].
///
/// The reader blocks on the pipe, so only the watchdog (an external actor
/// holding the child) can cut a run short.
pub async fn run_streaming(
    program: &str,
    args: &[String],
    timeout: Option<Duration>,
    on_line: OutputCallback<'_>,
) -> Result<ExecOutcome> {
    dlog_debug!("spawn: {} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::NotInstalled {
                    backend: program.to_string(),
                    hint: format!("'{}' was not found on PATH", program),
                }
            } else {
                Error::Io(e)
            }
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::AgentFailed("stdout pipe unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::AgentFailed("stderr pipe unavailable".to_string()))?;

    // stderr drains concurrently so a chatty child cannot deadlock on a
    // full pipe while we read stdout.
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    });

    let finished = CancellationToken::new();
    let watchdog_token = finished.clone();
    let watchdog = tokio::spawn(async move {
        match timeout {
            None => child.wait().await.map(WatchdogVerdict::Completed),
            Some(limit) => {
                tokio::select! {
                    _ = watchdog_token.cancelled() => {
                        child.wait().await.map(WatchdogVerdict::Completed)
                    }
                    _ = tokio::time::sleep(limit) => {
                        dlog_warn!("Watchdog fired after {:?}, killing child", limit);
                        let _ = child.start_kill();
                        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                            // Still alive after the grace period.
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                        }
                        Ok(WatchdogVerdict::TimedOut)
                    }
                }
            }
        }
    });

    let mut output = String::new();
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                on_line(line.trim());
                output.push_str(&line);
                output.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                // Reader errors after a kill are expected; the watchdog
                // verdict below decides what this run actually was.
                dlog_debug!("stdout read ended with error: {}", e);
                break;
            }
        }
    }

    // Normal completion path: signal the watchdog so it reaps and exits
    // without acting.
    finished.cancel();

    let verdict = tokio::time::timeout(KILL_GRACE + DRAIN_TIMEOUT, watchdog)
        .await
        .map_err(|_| Error::TaskJoin("watchdog did not settle".to_string()))?
        .map_err(|e| Error::TaskJoin(e.to_string()))??;

    if let Ok(Ok(err_output)) = tokio::time::timeout(DRAIN_TIMEOUT, stderr_task).await {
        output.push_str(&err_output);
    }

    match verdict {
        WatchdogVerdict::TimedOut => {
            Err(Error::Timeout(timeout.unwrap_or_default()))
        }
        WatchdogVerdict::Completed(status) => Ok(ExecOutcome {
            success: status.success(),
            output,
        }),
    }
}
