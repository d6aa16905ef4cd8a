//! Task data model and the durable task-list artifact.
//!
//! Tasks are the atomic units of work handed to agent backends. They are
//! parsed once from a markdown checklist at scheduler start, and the only
//! mutation the engine ever applies is marking a task complete after it
//! succeeds. The file format round-trips, so external tools (and humans)
//! can edit the list between runs.
//!
//! ```text
//! ## Setup
//! - [ ] (fundamental, order=1) Create database schema
//! - [ ] (fundamental) Wire configuration
//!
//! ## Features
//! - [ ] Add search endpoint
//! - [x] Add health check
//! ```
//!
//! Entries without a `(fundamental...)` marker are independent. Group
//! headings (`##`) are display-only labels.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::{dlog_debug, Error, Result};

/// Execution category of a task.
///
/// Fundamental tasks run sequentially in dependency order before anything
/// else; independent tasks may run concurrently with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Fundamental,
    Independent,
}

/// A single work item from the task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Human-readable name, unique within one list.
    pub name: String,
    /// Whether the task has already been completed.
    pub completed: bool,
    /// Execution category, immutable after parse.
    pub category: TaskCategory,
    /// Explicit dependency order. Meaningful for fundamental tasks;
    /// `None` sorts after every explicit order.
    pub order: Option<u32>,
    /// Display-only group label from the nearest preceding heading.
    pub group_label: Option<String>,
    /// Zero-based position in the source file, used as the sort tie-break.
    pub source_position: usize,
}

impl Task {
    /// Sort key for Phase-1 ordering.
    ///
    /// Tasks with an explicit order precede implicit-zero tasks; ties are
    /// broken by source position, which keeps the sort total and stable.
    pub fn sort_key(&self) -> (bool, u32, usize) {
        (self.order.is_none(), self.order.unwrap_or(0), self.source_position)
    }
}

/// The parsed task list plus the path of its durable artifact.
#[derive(Debug, Clone)]
pub struct TaskList {
    tasks: Vec<Task>,
    path: Option<PathBuf>,
}

fn entry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^- \[(?<done> |x|X)\] (?:\((?<cat>fundamental|independent)(?:,\s*order=(?<ord>\d+))?\)\s+)?(?<name>\S.*)$",
        )
        .unwrap()
    })
}

impl TaskList {
    /// Parse a task list from its text content.
    ///
    /// Lines that are not entries or `##` headings are ignored. Duplicate
    /// task names are rejected: the scheduler and the mark-complete call
    /// both address tasks by name.
    pub fn parse_str(content: &str) -> Result<Self> {
        let mut tasks = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut group: Option<String> = None;

        for line in content.lines() {
            let trimmed = line.trim_end();
            if let Some(heading) = trimmed.strip_prefix("## ") {
                group = Some(heading.trim().to_string());
                continue;
            }
            let Some(caps) = entry_regex().captures(trimmed) else {
                continue;
            };
            let name = caps["name"].trim().to_string();
            if !seen.insert(name.clone()) {
                return Err(Error::TaskList(format!("duplicate task name: {}", name)));
            }
            let category = match caps.name("cat").map(|m| m.as_str()) {
                Some("fundamental") => TaskCategory::Fundamental,
                _ => TaskCategory::Independent,
            };
            let order = caps
                .name("ord")
                .map(|m| m.as_str().parse::<u32>())
                .transpose()
                .map_err(|e| Error::TaskList(format!("bad order for {}: {}", name, e)))?;
            tasks.push(Task {
                name,
                completed: !caps["done"].trim().is_empty(),
                category,
                order,
                group_label: group.clone(),
                source_position: tasks.len(),
            });
        }

        Ok(Self { tasks, path: None })
    }

    /// Load and parse the task list file, remembering its path for
    /// mark-complete writes.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut list = Self::parse_str(&content)?;
        list.path = Some(path.to_path_buf());
        dlog_debug!("Loaded {} tasks from {}", list.tasks.len(), path.display());
        Ok(list)
    }

    /// Serialize back to the canonical file format.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let mut current_group: Option<&str> = None;
        for task in &self.tasks {
            let group = task.group_label.as_deref();
            if group != current_group {
                if let Some(label) = group {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str("## ");
                    out.push_str(label);
                    out.push('\n');
                }
                current_group = group;
            }
            out.push_str(&Self::entry_line(task));
            out.push('\n');
        }
        out
    }

    fn entry_line(task: &Task) -> String {
        let checkbox = if task.completed { "x" } else { " " };
        let marker = match (task.category, task.order) {
            (TaskCategory::Fundamental, Some(n)) => format!("(fundamental, order={}) ", n),
            (TaskCategory::Fundamental, None) => "(fundamental) ".to_string(),
            (TaskCategory::Independent, _) => String::new(),
        };
        format!("- [{}] {}{}", checkbox, marker, task.name)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Tasks that still need to run.
    pub fn pending(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.completed)
    }

    /// Mark a task complete, in memory and in the artifact file.
    ///
    /// Idempotent: re-marking an already-complete task changes neither the
    /// in-memory state nor a single byte of the file. The file edit flips
    /// only the entry's checkbox, so surrounding prose and formatting
    /// survive untouched.
    pub fn mark_complete(&mut self, name: &str) -> Result<()> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::TaskNotFound(name.to_string()))?;
        if task.completed {
            return Ok(());
        }
        task.completed = true;

        if let Some(path) = self.path.clone() {
            let content = fs::read_to_string(&path)?;
            let mut changed = false;
            let mut lines: Vec<String> = Vec::with_capacity(content.lines().count());
            for line in content.lines() {
                let trimmed = line.trim_end();
                let is_target = entry_regex()
                    .captures(trimmed)
                    .map(|caps| caps["name"].trim() == name)
                    .unwrap_or(false);
                if is_target && !changed {
                    lines.push(line.replacen("- [ ]", "- [x]", 1));
                    changed = true;
                } else {
                    lines.push(line.to_string());
                }
            }
            if changed {
                let mut out = lines.join("\n");
                if content.ends_with('\n') {
                    out.push('\n');
                }
                fs::write(&path, out)?;
            }
        }
        Ok(())
    }
}
