use camino::Utf8PathBuf;
use thiserror::Error;

pub use anyhow::Error as RuntimeError;

/// Structural misconfiguration, detected before any task executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Task '{0}' is registered more than once")]
    DuplicateTask(String),

    #[error("Task '{0}' is not registered")]
    UnknownTask(String),

    #[error("Task '{0}' is not a composite, children can't be attached to it")]
    NotComposite(String),

    #[error("Attaching '{child}' to '{parent}' would form a cycle")]
    Cycle { parent: String, child: String },

    #[error("Tasks '{first}' and '{second}' may run concurrently but both write '{path}'")]
    OutputCollision {
        path: Utf8PathBuf,
        first: String,
        second: String,
    },

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't plan outputs of task '{0}'.\n{1}")]
    Plan(String, Box<TaskError>),
}

/// A failure raised by a single stage, either for one record or for a whole set.
#[derive(Debug, Error)]
pub enum StageError {
    /// Malformed source content. Normally absorbed by `diagnose-and-continue`.
    #[error("{0}")]
    Content(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    pub fn content(message: impl Into<String>) -> Self {
        Self::Content(message.into())
    }
}

/// Failure of a task run. Every variant is fatal for the task it came from.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Stage '{stage}' aborted the pipeline on '{file}':\n{source}")]
    Stage {
        stage: String,
        file: Utf8PathBuf,
        source: StageError,
    },

    #[error("Output '{0}' is produced more than once by the same task")]
    DuplicateOutput(Utf8PathBuf),

    #[error("Task '{task}' failed, {skipped} remaining task(s) skipped:\n{source}")]
    Halted {
        task: String,
        skipped: usize,
        source: Box<TaskError>,
    },

    #[error("{failed} of {total} parallel tasks failed: {names}")]
    Aggregation {
        failed: usize,
        total: usize,
        names: String,
    },

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Userland(#[from] anyhow::Error),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Watch path '{0}' can't be resolved: {1}")]
    Resolve(String, anyhow::Error),

    #[error("Watcher is already running")]
    AlreadyStarted,
}
