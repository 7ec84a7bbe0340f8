pub(crate) mod diagnostics;
#[cfg(feature = "server")]
pub(crate) mod http;
#[cfg(feature = "live")]
pub(crate) mod reload;
#[cfg(feature = "live")]
pub(crate) mod watch;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::blueprint::{Website, children};
use crate::engine::{Category, Diagnostic, ErrorSink, Handle, Recorder, Runnable, Task, TaskContext};
use crate::error::TaskError;

/// Changed output of one leaf task.
#[derive(Debug, Clone)]
pub struct Change {
    pub task: String,
    pub category: Category,
    pub paths: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task: String,
    pub start: Instant,
    pub duration: Duration,
}

/// Aggregated result of running a task (usually a composite root).
#[derive(Debug)]
pub struct Report {
    /// Whether the root finished without a fatal failure.
    pub succeeded: bool,
    /// The failure of the root, if any.
    pub failure: Option<TaskError>,
    /// Every diagnostic recorded during this run, in arrival order.
    pub diagnostics: Vec<Diagnostic>,
    /// Changed outputs per leaf task, including leaves of a failed composite
    /// which themselves succeeded.
    pub changes: Vec<Change>,
    /// Execution times of every leaf that ran.
    pub timings: Vec<TaskExecution>,
}

impl Report {
    /// Whether the leaf named `task` actually ran.
    pub fn ran(&self, task: &str) -> bool {
        self.timings.iter().any(|t| t.task == task)
    }
}

struct Run<'a> {
    site: &'a Website,
    recorder: Recorder<'a>,
    changes: Mutex<Vec<Change>>,
    timings: Mutex<Vec<TaskExecution>>,
    root_span: Span,
    pb_style: ProgressStyle,
}

/// Executes the task rooted at `root` to completion.
///
/// Composites are walked recursively. A sequential group runs its children
/// one after another and stops at the first failure; since a leaf only
/// returns after all of its outputs are flushed, child N+1 always observes
/// the complete output of child N. A parallel group hands every child to the
/// rayon pool, waits for all of them and fails if any of them failed.
pub(crate) fn run(site: &Website, root: Handle, sink: &ErrorSink) -> Report {
    let root_name = site.graph[root.0].name().to_owned();
    let total = count_leaves(site, root.0);

    let root_span = tracing::info_span!("run", task = %root_name);
    if let Ok(style) = crate::utils::get_style_run() {
        root_span.pb_set_style(&style);
    }
    root_span.pb_set_length(total);
    root_span.pb_set_message(&format!("Running {root_name}..."));
    let _enter = root_span.enter();

    let run = Run {
        site,
        recorder: Recorder::new(sink),
        changes: Mutex::new(Vec::new()),
        timings: Mutex::new(Vec::new()),
        root_span: root_span.clone(),
        pb_style: crate::utils::get_style_task()
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    };

    let s = Instant::now();
    let result = run.exec(root.0);

    match &result {
        Ok(()) => tracing::info!(
            "finished {} {}",
            root_name,
            crate::utils::as_overhead(s.elapsed())
        ),
        Err(e) => tracing::error!("{} failed: {}", root_name, e),
    }

    let timings = run.timings.into_inner().unwrap();
    for exec in &timings {
        tracing::debug!("{} took {:.2?}", exec.task, exec.duration);
    }

    Report {
        succeeded: result.is_ok(),
        failure: result.err(),
        diagnostics: run.recorder.into_inner(),
        changes: run.changes.into_inner().unwrap(),
        timings,
    }
}

impl Run<'_> {
    fn exec(&self, index: NodeIndex) -> Result<(), TaskError> {
        match &self.site.graph[index] {
            Task::Leaf { name, runnable } => self.exec_leaf(name, runnable.as_ref()),
            Task::Sequential { name } => {
                let children = children(&self.site.graph, index);

                for (i, &child) in children.iter().enumerate() {
                    if let Err(source) = self.exec(child) {
                        let skipped = children.len() - i - 1;
                        if skipped > 0 {
                            tracing::warn!("{name}: skipping {skipped} remaining task(s)");
                        }

                        return Err(TaskError::Halted {
                            task: self.site.graph[child].name().to_owned(),
                            skipped,
                            source: Box::new(source),
                        });
                    }
                }

                Ok(())
            }
            Task::Parallel { .. } => {
                let children = children(&self.site.graph, index);

                let results: Vec<_> = children
                    .par_iter()
                    .map(|&child| (child, self.exec(child)))
                    .collect();

                let failed: Vec<_> = results
                    .iter()
                    .filter(|(_, result)| result.is_err())
                    .map(|(child, _)| self.site.graph[*child].name())
                    .collect();

                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(TaskError::Aggregation {
                        failed: failed.len(),
                        total: children.len(),
                        names: failed.join(", "),
                    })
                }
            }
        }
    }

    fn exec_leaf(&self, name: &str, runnable: &dyn Runnable) -> Result<(), TaskError> {
        let span = tracing::info_span!(parent: &self.root_span, "task", name = %name);
        span.pb_set_style(&self.pb_style);
        span.pb_set_message(&format!("Running {name}"));
        let _enter = span.enter();

        let context = TaskContext {
            env: &self.site.env,
            name,
            recorder: &self.recorder,
            span: span.clone(),
        };

        let start = Instant::now();

        // a panic fails this task only
        let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runnable.run(&context)
        })) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };

                Err(TaskError::Panic(msg))
            }
        };

        let duration = start.elapsed();
        self.timings.lock().unwrap().push(TaskExecution {
            task: name.to_owned(),
            start,
            duration,
        });
        self.root_span.pb_inc(1);

        match result {
            Ok(outcome) => {
                tracing::debug!("{name}: {} file(s) changed", outcome.written.len());

                if !outcome.written.is_empty() {
                    self.changes.lock().unwrap().push(Change {
                        task: name.to_owned(),
                        category: runnable.category(),
                        paths: outcome.written,
                    });
                }

                Ok(())
            }
            Err(err) => {
                let mut diagnostic = Diagnostic::fatal(name, err.to_string());
                if let TaskError::Stage { stage, file, .. } = &err {
                    diagnostic.stage = Some(stage.clone());
                    diagnostic.file = Some(file.clone());
                }

                self.recorder.record(diagnostic);
                Err(err)
            }
        }
    }
}

fn count_leaves(site: &Website, index: NodeIndex) -> u64 {
    match &site.graph[index] {
        Task::Leaf { .. } => 1,
        _ => children(&site.graph, index)
            .into_iter()
            .map(|child| count_leaves(site, child))
            .sum(),
    }
}
