//! Task declarations and per-run outcomes.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use thiserror::Error;

use crate::cache::BuildCache;
use crate::paths::{AssetClass, PathMap};
use crate::Mode;

/// Result from a single executed task action.
pub type TaskResult<T> = anyhow::Result<T>;

/// Everything an action may touch while it runs. Actions execute on worker
/// threads, so the shared build cache sits behind a mutex.
pub struct TaskContext<'a> {
    pub mode: Mode,
    /// Websocket port browsers should connect to for live reload, present
    /// only when a preview session is running.
    pub reload_port: Option<u16>,
    /// Root of the emitted site, the directory the preview server hosts.
    /// Root-relative references in emitted HTML resolve under it.
    pub out_dir: &'a Utf8Path,
    pub paths: &'a PathMap,
    pub cache: &'a Mutex<BuildCache>,
}

type TaskFnPtr = Arc<dyn Fn(&TaskContext) -> TaskResult<()> + Send + Sync>;

/// Error an action can return to attribute a failure to the external
/// transform unit that produced it, rather than to the task as a whole.
#[derive(Debug, Error)]
#[error("{unit}: {message}")]
pub struct TransformError {
    pub unit: String,
    pub message: String,
}

impl TransformError {
    pub fn new(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            message: message.into(),
        }
    }
}

/// A named unit of build work with explicit prerequisites.
#[derive(Clone)]
pub struct Task {
    pub(crate) name: String,
    pub(crate) prerequisites: Vec<String>,
    pub(crate) class: Option<AssetClass>,
    pub(crate) action: TaskFnPtr,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&TaskContext) -> TaskResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            prerequisites: Vec::new(),
            class: None,
            action: Arc::new(action),
        }
    }

    /// Declare the tasks that must complete successfully before this
    /// one's action may begin.
    pub fn after(mut self, prerequisites: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.prerequisites
            .extend(prerequisites.into_iter().map(Into::into));
        self
    }

    /// Tag the task with the asset class it rebuilds. Successful completion
    /// then publishes a rebuilt event for that class.
    pub fn class(mut self, class: AssetClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run(&self, context: &TaskContext) -> TaskResult<()> {
        (self.action)(context)
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.name)
    }
}

/// Outcome of a single task within one graph run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    /// The action ran and failed. `unit` identifies the failing transform,
    /// falling back to the task name when the action didn't attribute it.
    Failed { unit: String, message: String },
    /// The action never began because a prerequisite failed.
    Skipped { failed: String },
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: String,
    pub status: TaskStatus,
}

/// Report from one invocation of [`TaskGraph::run`](crate::graph::TaskGraph::run).
///
/// A run "resolves" even when tasks fail; the caller decides whether that
/// is fatal (one-shot build) or survivable (watch loop).
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| outcome.status == TaskStatus::Succeeded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, TaskStatus::Failed { .. }))
    }

    pub fn status_of(&self, task: &str) -> Option<&TaskStatus> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.task == task)
            .map(|outcome| &outcome.status)
    }
}
