//! Agent backend capability contract.
//!
//! A backend wraps one external AI coding-agent CLI. The scheduler only
//! depends on the [`AgentBackend`] trait, so any conforming object works —
//! including scripted test doubles — without extending a base type. The
//! shared execution machinery (prompt-file parsing, the timeout-enforcing
//! process runner) lives in [`base`] and is composed by adapters, not
//! inherited.

pub mod base;
pub mod claude;
pub mod codex;

pub use base::{PromptMetadata, SubagentDefinition};
pub use claude::ClaudeBackend;
pub use codex::CodexBackend;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Identifier of a supported backend platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Claude Code CLI (`claude`).
    Claude,
    /// Codex CLI (`codex`).
    Codex,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(BackendKind::Claude),
            "codex" => Ok(BackendKind::Codex),
            other => Err(Error::NotConfigured(format!(
                "unknown backend platform '{}'; set backend = \"claude\" or \"codex\" \
                 in drover.toml or pass --backend",
                other
            ))),
        }
    }
}

/// One agent invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// The prompt text handed to the agent.
    pub prompt: String,
    /// Symbolic name of a subagent definition file, if any.
    pub subagent: Option<String>,
    /// Explicit model override. See [`base::resolve_model`] for precedence.
    pub model: Option<String>,
    /// Run in a fresh session, sharing no state with other invocations.
    pub isolate_session: bool,
    /// Watchdog timeout for the child process; `None` means unbounded.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_subagent(mut self, subagent: impl Into<String>) -> Self {
        self.subagent = Some(subagent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn isolated(mut self) -> Self {
        self.isolate_session = true;
        self
    }
}

/// Outcome of a streamed or captured agent run.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Whether the agent reported success.
    pub success: bool,
    /// Full accumulated output, raw lines joined by newlines.
    pub output: String,
}

/// Per-line streaming callback. Lines arrive trimmed, in emission order.
pub type OutputCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Capability contract every agent backend satisfies.
///
/// Instances are created once per run and shared read-only across workers
/// as `Arc<dyn AgentBackend>`. A backend that wraps a tool holding
/// exclusive machine-wide state overrides `supports_parallel_execution`.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Platform identifier.
    fn kind(&self) -> BackendKind;

    /// Execute one prompt, streaming each output line to `on_line` as it is
    /// produced.
    ///
    /// A watchdog timeout surfaces as [`Error::Timeout`]; a missing CLI as
    /// [`Error::NotInstalled`].
    async fn run_with_callback(
        &self,
        request: &ExecRequest,
        on_line: OutputCallback<'_>,
    ) -> Result<ExecOutcome>;

    /// Execute without streaming; same semantics otherwise.
    async fn run_and_capture(&self, request: &ExecRequest) -> Result<ExecOutcome> {
        self.run_with_callback(request, &|_| {}).await
    }

    /// Execute and return bare output text with no success flag.
    ///
    /// Callers infer success from the content; use [`run_and_capture`]
    /// when a verdict is needed. The asymmetry with the other variants is
    /// part of the contract of the wrapped tools' quiet paths and is kept
    /// as-is.
    ///
    /// [`run_and_capture`]: AgentBackend::run_and_capture
    async fn run_quiet(&self, request: &ExecRequest) -> Result<String>;

    /// Whether the wrapped CLI is reachable, with a human-readable message
    /// either way.
    fn check_installed(&self) -> (bool, String);

    /// Backend-specific heuristic for rate-limit shaped output.
    fn detect_rate_limit(&self, output: &str) -> bool;

    /// Whether multiple invocations may run concurrently.
    fn supports_parallel_execution(&self) -> bool {
        true
    }

    /// Release any resources held by the backend. Default no-op.
    fn close(&self) {}
}

/// Build the configured backend.
pub fn create_backend(config: &RunConfig) -> Result<Arc<dyn AgentBackend>> {
    let backend: Arc<dyn AgentBackend> = match config.backend {
        BackendKind::Claude => Arc::new(ClaudeBackend::from_config(config)),
        BackendKind::Codex => Arc::new(CodexBackend::from_config(config)),
    };
    Ok(backend)
}

/// Pre-flight installation check, turning a missing CLI into a fatal
/// [`Error::NotInstalled`] before any task starts.
pub fn preflight(backend: &dyn AgentBackend) -> Result<()> {
    let (installed, message) = backend.check_installed();
    if installed {
        crate::dlog_debug!("Backend {}: {}", backend.name(), message);
        Ok(())
    } else {
        Err(Error::NotInstalled {
            backend: backend.name().to_string(),
            hint: message,
        })
    }
}
