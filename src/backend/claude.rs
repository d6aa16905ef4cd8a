//! Claude Code backend adapter.
//!
//! Wraps the `claude` CLI in non-interactive one-shot mode (`-p`) with
//! `stream-json` output, translating the capability contract into that
//! tool's flags. Streamed JSON events are decoded on the fly: assistant
//! text reaches the per-line callback, the final `result` event decides
//! success.
//!
//! Known limitation, mirrored from the wrapped tool rather than papered
//! over: when a symbolic subagent is passed via `--agent`, the CLI may take
//! its model from the subagent's own definition and silently ignore an
//! explicit `--model` override.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use super::base::{load_subagent, resolve_model, run_streaming, SubagentDefinition};
use super::{AgentBackend, BackendKind, ExecOutcome, ExecRequest, OutputCallback};
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::retry::is_transient_text;

/// One line of `--output-format stream-json` output.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    #[serde(default)]
    is_error: Option<bool>,
    result: Option<String>,
    message: Option<StreamMessage>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

/// Claude Code CLI adapter.
pub struct ClaudeBackend {
    binary: String,
    default_model: Option<String>,
    agents_dir: PathBuf,
}

impl ClaudeBackend {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            binary: "claude".to_string(),
            default_model: config.default_model.clone(),
            agents_dir: config.agents_dir.clone(),
        }
    }

    /// Use a specific binary path. Useful for tests and non-standard
    /// installations.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Resolve the subagent definition (if requested) and build the argv
    /// for one invocation.
    fn build_args(
        &self,
        request: &ExecRequest,
        output_format: &str,
    ) -> Result<(Vec<String>, Option<SubagentDefinition>)> {
        let subagent = request
            .subagent
            .as_deref()
            .map(|name| load_subagent(&self.agents_dir, name))
            .transpose()?;

        let model = resolve_model(
            request.model.as_deref(),
            subagent.as_ref().map(|s| &s.metadata),
            self.default_model.as_deref(),
        );

        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            output_format.to_string(),
        ];
        if output_format == "stream-json" {
            args.push("--verbose".to_string());
        }
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model);
        }
        if let Some(def) = &subagent {
            args.push("--agent".to_string());
            args.push(def.name.clone());
        }
        if request.isolate_session {
            args.push("--session-id".to_string());
            args.push(uuid::Uuid::new_v4().to_string());
        }
        Ok((args, subagent))
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &str {
        "Claude Code"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    async fn run_with_callback(
        &self,
        request: &ExecRequest,
        on_line: OutputCallback<'_>,
    ) -> Result<ExecOutcome> {
        let (args, _subagent) = self.build_args(request, "stream-json")?;

        // The final result event decides success; exit status is the
        // fallback when the stream ends without one.
        let reported: Mutex<Option<bool>> = Mutex::new(None);
        let decode = |line: &str| {
            let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
                // Not every line is an event; pass it through untouched.
                if !line.is_empty() {
                    on_line(line);
                }
                return;
            };
            match event.kind.as_str() {
                "assistant" => {
                    for block in event.message.iter().flat_map(|m| &m.content) {
                        if block.kind == "text" {
                            for text_line in block.text.iter().flat_map(|t| t.lines()) {
                                on_line(text_line.trim());
                            }
                        }
                    }
                }
                "result" => {
                    let ok = !event.is_error.unwrap_or(false)
                        && event.subtype.as_deref() != Some("error");
                    if let Ok(mut slot) = reported.lock() {
                        *slot = Some(ok);
                    }
                    if let Some(text) = &event.result {
                        if !ok {
                            on_line(text.trim());
                        }
                    }
                }
                _ => {}
            }
        };

        let raw = run_streaming(&self.binary, &args, request.timeout, &decode).await?;
        let success = reported
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .unwrap_or(raw.success);
        Ok(ExecOutcome {
            success,
            output: raw.output,
        })
    }

    async fn run_quiet(&self, request: &ExecRequest) -> Result<String> {
        let (args, _subagent) = self.build_args(request, "text")?;

        // Quiet runs without a timeout take the direct path.
        if request.timeout.is_none() {
            let output = tokio::process::Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::NotInstalled {
                            backend: self.binary.clone(),
                            hint: format!("'{}' was not found on PATH", self.binary),
                        }
                    } else {
                        Error::Io(e)
                    }
                })?;
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let raw = run_streaming(&self.binary, &args, request.timeout, &|_| {}).await?;
        Ok(raw.output.trim().to_string())
    }

    fn check_installed(&self) -> (bool, String) {
        match which::which(&self.binary) {
            Ok(path) => (true, format!("found at {}", path.display())),
            Err(_) => (
                false,
                format!(
                    "'{}' not found on PATH; install Claude Code and sign in first",
                    self.binary
                ),
            ),
        }
    }

    fn detect_rate_limit(&self, output: &str) -> bool {
        let lower = output.to_lowercase();
        is_transient_text(output, &[])
            || lower.contains("rate_limit_error")
            || lower.contains("overloaded_error")
            || lower.contains("529")
    }
}
