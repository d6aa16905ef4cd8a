pub mod backend;
pub mod config;
pub mod display;
pub mod error;
pub mod log;
pub mod retry;
pub mod scheduler;
pub mod tasklist;

pub use backend::{AgentBackend, BackendKind, ExecOutcome, ExecRequest};
pub use error::{Error, Result};
pub use scheduler::{RunSummary, Scheduler, TaskResult};
pub use tasklist::{Task, TaskCategory, TaskList};
