//! Codex CLI backend adapter.
//!
//! Wraps `codex exec` in one-shot mode. Codex has no subagent flag, so a
//! requested subagent's body is inlined ahead of the prompt; its
//! front-matter still participates in model resolution. Output is streamed
//! as plain text lines.

use async_trait::async_trait;
use std::path::PathBuf;

use super::base::{load_subagent, resolve_model, run_streaming};
use super::{AgentBackend, BackendKind, ExecOutcome, ExecRequest, OutputCallback};
use crate::config::RunConfig;
use crate::error::Result;
use crate::retry::is_transient_text;

/// Codex CLI adapter.
pub struct CodexBackend {
    binary: String,
    default_model: Option<String>,
    agents_dir: PathBuf,
}

impl CodexBackend {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            binary: "codex".to_string(),
            default_model: config.default_model.clone(),
            agents_dir: config.agents_dir.clone(),
        }
    }

    /// Use a specific binary path.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn build_args(&self, request: &ExecRequest) -> Result<Vec<String>> {
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

        let prompt = match &subagent {
            Some(def) if !def.body.is_empty() => {
                format!("{}\n\n{}", def.body, request.prompt)
            }
            _ => request.prompt.clone(),
        };

        let mut args = vec!["exec".to_string(), "--skip-git-repo-check".to_string()];
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model);
        }
        args.push(prompt);
        Ok(args)
    }
}

#[async_trait]
impl AgentBackend for CodexBackend {
    fn name(&self) -> &str {
        "Codex"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Codex
    }

    async fn run_with_callback(
        &self,
        request: &ExecRequest,
        on_line: OutputCallback<'_>,
    ) -> Result<ExecOutcome> {
        let args = self.build_args(request)?;
        run_streaming(&self.binary, &args, request.timeout, on_line).await
    }

    async fn run_quiet(&self, request: &ExecRequest) -> Result<String> {
        let args = self.build_args(request)?;
        let raw = run_streaming(&self.binary, &args, request.timeout, &|_| {}).await?;
        Ok(raw.output.trim().to_string())
    }

    fn check_installed(&self) -> (bool, String) {
        match which::which(&self.binary) {
            Ok(path) => (true, format!("found at {}", path.display())),
            Err(_) => (
                false,
                format!("'{}' not found on PATH; install the Codex CLI first", self.binary),
            ),
        }
    }

    fn detect_rate_limit(&self, output: &str) -> bool {
        let lower = output.to_lowercase();
        is_transient_text(output, &[]) || lower.contains("usage limit")
    }
}
