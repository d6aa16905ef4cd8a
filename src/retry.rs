//! Retry policy for transient agent failures.
//!
//! Wraps a single task execution with exponential-backoff-plus-jitter
//! retries. Rate limits and other transient signals are retried up to the
//! configured budget; everything else propagates immediately. The jitter
//! source is injectable so tests get a reproducible delay sequence.

use rand::Rng;
use regex::Regex;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use crate::{dlog_warn, Error, Result};

/// Built-in substrings that mark an error as transient.
///
/// Backends layer their own heuristics on top via `detect_rate_limit`;
/// this set covers the generic network and HTTP signals.
const TRANSIENT_INDICATORS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota exceeded",
    "throttle",
    "overloaded",
    "connection refused",
    "connection reset",
    "network error",
    "temporarily unavailable",
];

/// Word-bounded HTTP status codes treated as transient.
fn transient_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(429|502|503|504)\b").unwrap())
}

/// Check error text for transient indicators.
///
/// `extra` carries run-configured indicators on top of the built-in set.
pub fn is_transient_text(text: &str, extra: &[String]) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_INDICATORS.iter().any(|p| lower.contains(p))
        || extra.iter().any(|p| lower.contains(&p.to_lowercase()))
        || transient_code_regex().is_match(&lower)
}

/// Immutable retry tuning for one run.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Retries after the initial attempt; 0 disables retrying.
    pub max_retries: u32,
    /// First-retry delay before jitter.
    pub base_delay: Duration,
    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,
    /// Jitter as a fraction of the exponential delay (0 disables jitter).
    pub jitter_factor: f64,
    /// Extra retryable indicators from configuration.
    pub retry_indicators: Vec<String>,
    /// Whether watchdog timeouts count as retryable.
    pub retry_on_timeout: bool,
}

impl RateLimitConfig {
    /// Build a validated config.
    ///
    /// Rejects a negative or non-finite `jitter_factor` and a `max_delay`
    /// below `base_delay`.
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
    ) -> Result<Self> {
        if !jitter_factor.is_finite() || jitter_factor < 0.0 {
            return Err(Error::Validation(format!(
                "jitter_factor must be a non-negative number, got {}",
                jitter_factor
            )));
        }
        if max_delay < base_delay {
            return Err(Error::Validation(format!(
                "max_delay ({:?}) must be >= base_delay ({:?})",
                max_delay, base_delay
            )));
        }
        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            jitter_factor,
            retry_indicators: Vec::new(),
            retry_on_timeout: false,
        })
    }
}

impl Default for RateLimitConfig {
    /// Default: 3 retries, 2s base, 60s cap, 50% jitter.
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
            retry_indicators: Vec::new(),
            retry_on_timeout: false,
        }
    }
}

/// Source of jitter units in `[0, 1)`.
pub type JitterFn = Box<dyn Fn() -> f64 + Send + Sync>;

/// Executes one operation with exponential backoff on transient errors.
pub struct RetryPolicy {
    config: RateLimitConfig,
    jitter: JitterFn,
}

impl RetryPolicy {
    /// Create a policy with uniform random jitter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            jitter: Box::new(|| rand::rng().random_range(0.0..1.0)),
        }
    }

    /// Create a policy with an injected jitter source.
    ///
    /// A fixed source makes the delay sequence reproducible in tests.
    pub fn with_jitter(config: RateLimitConfig, jitter: JitterFn) -> Self {
        Self { config, jitter }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Compute the delay before retry `attempt` (0-indexed) given a jitter
    /// unit in `[0, 1)`.
    ///
    /// `base * 2^attempt` plus `unit * jitter_factor` of the same, capped at
    /// `max_delay`. Pure, so the sequence is directly testable.
    pub fn delay_for(&self, attempt: u32, unit: f64) -> Duration {
        let exp = self.config.base_delay.as_secs_f64() * 2f64.powi(attempt.min(62) as i32);
        let jittered = exp + unit * self.config.jitter_factor * exp;
        Duration::from_secs_f64(jittered.min(self.config.max_delay.as_secs_f64()))
    }

    /// Classify an error as retryable or fatal.
    ///
    /// Rate limits always retry; timeouts only when configured; agent
    /// failures retry when their text carries a transient indicator.
    /// Installation and configuration errors never retry.
    pub fn is_retryable(&self, err: &Error) -> bool {
        match err {
            Error::RateLimited(_) => true,
            Error::Timeout(_) => self.config.retry_on_timeout,
            Error::AgentFailed(text) => {
                is_transient_text(text, &self.config.retry_indicators)
            }
            _ => false,
        }
    }

    /// Run `op`, retrying transient failures.
    ///
    /// `notify` is called once per scheduled retry with the retry number
    /// (1-based), the computed delay, and the error being retried. After the
    /// budget is spent the last error is wrapped in
    /// [`Error::RetriesExhausted`] with the attempt count and total wait.
    pub async fn run<T, F, Fut, N>(&self, mut op: F, mut notify: N) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        N: FnMut(u32, Duration, &Error),
    {
        let mut total_wait = Duration::ZERO;
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.is_retryable(&err) {
                        return Err(err);
                    }
                    if attempt == self.config.max_retries {
                        last_err = Some(err);
                        break;
                    }
                    let delay = self.delay_for(attempt, (self.jitter)());
                    dlog_warn!(
                        "Transient failure (attempt {}/{}), retrying in {:.1}s: {}",
                        attempt + 1,
                        self.config.max_retries + 1,
                        delay.as_secs_f64(),
                        err
                    );
                    notify(attempt + 1, delay, &err);
                    total_wait += delay;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // Only reachable with a retryable error left over.
        let source = last_err.unwrap_or_else(|| {
            Error::AgentFailed("retry budget spent with no recorded error".to_string())
        });
        Err(Error::RetriesExhausted {
            attempts: self.config.max_retries + 1,
            total_wait,
            source: Box::new(source),
        })
    }
}
