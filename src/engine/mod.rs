pub(crate) mod runner;

use std::sync::Arc;

use camino::Utf8PathBuf;
use petgraph::graph::NodeIndex;

use crate::core::Environment;
use crate::error::TaskError;

pub use crate::engine::runner::diagnostics::{Diagnostic, ErrorSink, Severity, Summary};
pub(crate) use crate::engine::runner::diagnostics::Recorder;
pub use crate::engine::runner::{Change, Report};

/// How connected browsers react when a task's output changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Stylesheets, replaced in place without reloading the page.
    Styles,
    /// Pages, which require a full reload.
    Markup,
    /// Scripts, which require a full reload.
    Scripts,
    /// Images, fonts and everything else, which require a full reload.
    Other,
}

impl Category {
    /// Whether the change can be applied without a full page reload.
    pub fn is_injectable(self) -> bool {
        matches!(self, Category::Styles)
    }
}

/// A type-safe reference to a task registered in a [`Blueprint`](crate::Blueprint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub(crate) NodeIndex);

impl Handle {
    /// Returns the underlying `NodeIndex` of the task in the graph.
    pub fn index(&self) -> NodeIndex {
        self.0
    }
}

/// What a leaf task reports back after it ran successfully.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Output paths, relative to the output root, whose content changed.
    pub written: Vec<Utf8PathBuf>,
}

/// The unit of work behind every leaf task.
///
/// [`Pipeline`](crate::Pipeline) is the usual implementation, but anything
/// that can run against a [`TaskContext`] can be registered.
pub trait Runnable: Send + Sync {
    fn run(&self, ctx: &TaskContext<'_>) -> Result<Outcome, TaskError>;

    /// Decides how browsers react to changes in this task's output.
    fn category(&self) -> Category {
        Category::Other
    }

    /// Destination paths this task would write if it ran now.
    ///
    /// Used once at startup to reject tasks which may run concurrently while
    /// writing the same file. The default claims nothing.
    fn plan(&self, _env: &Environment) -> Result<Vec<Utf8PathBuf>, TaskError> {
        Ok(Vec::new())
    }
}

/// Everything a running task can see.
pub struct TaskContext<'a> {
    /// Process-wide settings.
    pub env: &'a Environment,
    /// Name of the running task.
    pub name: &'a str,
    pub(crate) recorder: &'a Recorder<'a>,
    pub(crate) span: tracing::Span,
}

impl TaskContext<'_> {
    /// Records a diagnostic for this run and forwards it to the error sink.
    pub fn diagnose(&self, diagnostic: Diagnostic) {
        self.recorder.record(diagnostic);
    }

    /// Updates the progress message shown for this task.
    pub fn progress(&self, message: impl AsRef<str>) {
        use tracing_indicatif::span_ext::IndicatifSpanExt;
        self.span
            .pb_set_message(&format!("{}: {}", self.name, message.as_ref()));
    }
}

/// A leaf backed by a plain closure.
pub(crate) struct FnTask<F> {
    pub(crate) callback: F,
    pub(crate) category: Category,
}

impl<F> Runnable for FnTask<F>
where
    F: Fn(&TaskContext<'_>) -> anyhow::Result<Outcome> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext<'_>) -> Result<Outcome, TaskError> {
        Ok((self.callback)(ctx)?)
    }

    fn category(&self) -> Category {
        self.category
    }
}

/// A node in the task graph. Edges point from a composite to its children
/// and carry the child's position.
pub(crate) enum Task {
    Leaf {
        name: String,
        runnable: Arc<dyn Runnable>,
    },
    Sequential {
        name: String,
    },
    Parallel {
        name: String,
    },
}

impl Task {
    pub(crate) fn name(&self) -> &str {
        match self {
            Task::Leaf { name, .. } | Task::Sequential { name } | Task::Parallel { name } => name,
        }
    }

    pub(crate) fn is_composite(&self) -> bool {
        !matches!(self, Task::Leaf { .. })
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Task::Leaf { .. } => "leaf",
            Task::Sequential { .. } => "sequential",
            Task::Parallel { .. } => "parallel",
        }
    }
}
