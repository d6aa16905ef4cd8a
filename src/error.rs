use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task list error: {0}")]
    TaskList(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("{backend} is not installed: {hint}")]
    NotInstalled { backend: String, hint: String },

    #[error("No agent backend configured: {0}")]
    NotConfigured(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Agent run failed: {0}")]
    AgentFailed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Retries exhausted after {attempts} attempts ({total_wait:?} waited): {source}")]
    RetriesExhausted {
        attempts: u32,
        total_wait: Duration,
        #[source]
        source: Box<Error>,
    },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
