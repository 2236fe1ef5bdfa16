use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use thiserror::Error;

use crate::context::Context;
use crate::rpc::RpcError;

/// Name of the implicit bootstrap task; workers do not report host completion for it.
pub const CONNECT_TASK: &str = "connect";

/// How many hosts run a task and how they are picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Every selected host, at most `limit` at a time (`None` = global limit).
    Parallel { limit: Option<usize> },
    /// Only the first selected host.
    Once,
    /// The first selected host of every distinct node.
    OncePerNode,
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Parallel { limit: None }
    }
}

/// Outcome of a task body other than success.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Stop requested by the body; not a failure.
    #[error("graceful shutdown: {0}")]
    GracefulShutdown(String),

    #[error("{message} (exit code {code})")]
    Exit { code: i32, message: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    pub fn exit(code: i32, message: impl Into<String>) -> Self {
        TaskError::Exit {
            code,
            message: message.into(),
        }
    }

    /// Process exit status this outcome maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskError::GracefulShutdown(_) => 0,
            TaskError::Exit { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }
}

pub type TaskBody = Arc<dyn Fn(&mut Context<'_>) -> Result<(), TaskError> + Send + Sync>;

/// Named unit of work. Immutable once built.
#[derive(Clone)]
pub struct Task {
    name: String,
    selector: Option<String>,
    concurrency: Concurrency,
    verbose: bool,
    body: TaskBody,
    source: &'static Location<'static>,
}

impl Task {
    /// The caller's location is recorded for diagnostics.
    #[track_caller]
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Context<'_>) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            selector: None,
            concurrency: Concurrency::default(),
            verbose: false,
            body: Arc::new(body),
            source: Location::caller(),
        }
    }

    pub fn select(mut self, expr: impl Into<String>) -> Self {
        self.selector = Some(expr.into());
        self
    }

    pub fn once(mut self) -> Self {
        self.concurrency = Concurrency::Once;
        self
    }

    pub fn once_per_node(mut self) -> Self {
        self.concurrency = Concurrency::OncePerNode;
        self
    }

    /// Cap on concurrently running hosts; zero is treated as one.
    pub fn limit(mut self, limit: usize) -> Self {
        self.concurrency = Concurrency::Parallel {
            limit: Some(limit.max(1)),
        };
        self
    }

    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn task_limit(&self) -> Option<usize> {
        match self.concurrency {
            Concurrency::Parallel { limit } => limit,
            Concurrency::Once | Concurrency::OncePerNode => None,
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn source_location(&self) -> &'static Location<'static> {
        self.source
    }

    pub fn run(&self, ctx: &mut Context<'_>) -> Result<(), TaskError> {
        (self.body)(ctx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("selector", &self.selector)
            .field("concurrency", &self.concurrency)
            .field("verbose", &self.verbose)
            .field("source", &format_args!("{}", self.source))
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn builder_sets_policy_and_selector() {
        let task = Task::new("deploy", |_| Ok(())).select("stage=prod").limit(2);
        assert_eq!(task.name(), "deploy");
        assert_eq!(task.selector(), Some("stage=prod"));
        assert_eq!(task.task_limit(), Some(2));

        let once = Task::new("lock", |_| Ok(())).once();
        assert_eq!(once.concurrency(), Concurrency::Once);
        assert_eq!(once.task_limit(), None);
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        let task = Task::new("t", |_| Ok(())).limit(0);
        assert_eq!(task.task_limit(), Some(1));
    }

    #[test]
    fn source_location_points_at_construction_site() {
        let task = Task::new("t", |_| Ok(()));
        assert!(task.source_location().file().ends_with("task.rs"));
    }

    #[test]
    fn exit_codes_follow_outcome_kind() {
        assert_eq!(TaskError::GracefulShutdown("bye".into()).exit_code(), 0);
        assert_eq!(TaskError::exit(7, "boom").exit_code(), 7);
        assert_eq!(TaskError::exit(0, "odd").exit_code(), 1);
        assert_eq!(TaskError::from(anyhow!("nope")).exit_code(), 1);
    }
}
