//! Run configuration.
//!
//! Persistent settings live in `~/.drover/drover.toml` and are merged with
//! command-line overrides into a validated [`RunConfig`] that the scheduler
//! and backends consume. The engine never reads credentials; the wrapped
//! CLIs handle their own authentication.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::BackendKind;
use crate::retry::RateLimitConfig;
use crate::{dlog_debug, dlog_warn, Error, Result};

/// Default number of Phase-2 workers.
pub const DEFAULT_PARALLEL_TASKS: usize = 3;
/// Hard cap on Phase-2 workers.
pub const MAX_PARALLEL_TASKS: usize = 5;

/// Persistent configuration file contents.
///
/// All fields are optional in the file; [`Config::resolve`] fills in
/// defaults and validates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend platform identifier ("claude", "codex").
    pub backend: Option<String>,
    /// Default model passed to the backend when nothing else resolves.
    pub model: Option<String>,
    /// Number of concurrent Phase-2 workers (clamped to 1..=5).
    pub max_parallel_tasks: Option<usize>,
    /// Abort remaining work on the first failure.
    #[serde(default)]
    pub fail_fast: bool,
    /// Per-task timeout in seconds; absent means unbounded.
    pub task_timeout_secs: Option<f64>,
    /// Directory holding subagent definition files.
    pub agents_dir: Option<String>,
    /// Retry/backoff tuning.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

/// Raw retry settings as they appear in the config file.
///
/// Converted into an immutable [`RateLimitConfig`] during [`Config::resolve`],
/// which is where validation happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub jitter_factor: f64,
    /// Extra substrings treated as retryable, on top of the built-in set.
    #[serde(default)]
    pub retry_indicators: Vec<String>,
    /// Whether a watchdog timeout counts as retryable.
    #[serde(default)]
    pub retry_on_timeout: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 2.0,
            max_delay_secs: 60.0,
            jitter_factor: 0.5,
            retry_indicators: Vec::new(),
            retry_on_timeout: false,
        }
    }
}

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub max_parallel_tasks: Option<usize>,
    pub fail_fast: bool,
    pub task_timeout_secs: Option<f64>,
}

/// Fully resolved, validated configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub backend: BackendKind,
    pub default_model: Option<String>,
    pub max_parallel_tasks: usize,
    pub fail_fast: bool,
    pub task_timeout: Option<Duration>,
    pub agents_dir: PathBuf,
    pub rate_limit: RateLimitConfig,
}

impl Config {
    pub fn drover_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".drover"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::drover_dir()?.join("drover.toml"))
    }

    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::drover_dir()?.join("logs"))
    }

    pub fn default_agents_dir() -> Result<PathBuf> {
        Ok(Self::drover_dir()?.join("agents"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        dlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            dlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        dlog_debug!(
            "Config loaded: backend={:?}, max_parallel_tasks={:?}, fail_fast={}",
            config.backend,
            config.max_parallel_tasks,
            config.fail_fast
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let drover_dir = Self::drover_dir()?;
        if !drover_dir.exists() {
            fs::create_dir_all(&drover_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        dlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::drover_dir()?, Self::logs_dir()?] {
            if !dir.exists() {
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    /// Merge command-line overrides and produce the validated run config.
    ///
    /// Out-of-range `max_parallel_tasks` is clamped into `[1, 5]` with a
    /// warning rather than rejected; a malformed `rate_limit` section is a
    /// hard validation error.
    pub fn resolve(&self, overrides: &Overrides) -> Result<RunConfig> {
        let platform = overrides
            .backend
            .as_deref()
            .or(self.backend.as_deref())
            .unwrap_or("claude");
        let backend: BackendKind = platform.parse()?;

        let requested = overrides
            .max_parallel_tasks
            .or(self.max_parallel_tasks)
            .unwrap_or(DEFAULT_PARALLEL_TASKS);
        let max_parallel_tasks = requested.clamp(1, MAX_PARALLEL_TASKS);
        if max_parallel_tasks != requested {
            dlog_warn!(
                "max_parallel_tasks {} out of range, clamped to {}",
                requested,
                max_parallel_tasks
            );
        }

        let task_timeout = overrides
            .task_timeout_secs
            .or(self.task_timeout_secs)
            .map(Duration::from_secs_f64);

        let agents_dir = match &self.agents_dir {
            Some(dir) => expand_tilde(dir),
            None => Self::default_agents_dir()?,
        };

        let rl = &self.rate_limit;
        let mut rate_limit = RateLimitConfig::new(
            rl.max_retries,
            Duration::from_secs_f64(rl.base_delay_secs),
            Duration::from_secs_f64(rl.max_delay_secs),
            rl.jitter_factor,
        )?;
        rate_limit.retry_indicators = rl.retry_indicators.clone();
        rate_limit.retry_on_timeout = rl.retry_on_timeout;

        Ok(RunConfig {
            backend,
            default_model: overrides.model.clone().or_else(|| self.model.clone()),
            max_parallel_tasks,
            fail_fast: overrides.fail_fast || self.fail_fast,
            task_timeout,
            agents_dir,
            rate_limit,
        })
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
