//! Per-task streaming transform pipelines.
//!
//! A [`Pipeline`] scans its source globs lazily, pushes every [`FileRecord`]
//! through an ordered list of steps and writes the surviving records to the
//! output tree. Each step declares an [`ErrorPolicy`] which decides what a
//! failure on one record means for the rest of the run.

pub(crate) mod source;
pub mod sourcemap;

use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::core::Environment;
use crate::engine::{Category, Diagnostic, Outcome, Runnable, TaskContext};
use crate::error::{ConfigError, StageError, TaskError};
use crate::output::{Ledger, OutputEntry, check_unique};
use crate::utils::as_overhead;

use self::sourcemap::SourceMap;

/// What happens to a record when a stage fails on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// The task fails and no output of this run is written.
    AbortPipeline,
    /// The record is dropped without a trace.
    SkipRecord,
    /// The record is dropped, a recoverable diagnostic is emitted and the
    /// remaining records continue.
    DiagnoseAndContinue,
}

/// A single file moving through a pipeline.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Where the file was read from.
    pub source: Utf8PathBuf,
    /// Path relative to the static root of the glob that matched it.
    pub relative: Utf8PathBuf,
    pub contents: Vec<u8>,
    /// Destination, relative to the output root.
    pub dest: Utf8PathBuf,
    pub source_map: Option<SourceMap>,
    pub(crate) emit_map: bool,
}

impl FileRecord {
    pub fn new(
        source: impl Into<Utf8PathBuf>,
        relative: impl Into<Utf8PathBuf>,
        contents: impl Into<Vec<u8>>,
        dest: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            relative: relative.into(),
            contents: contents.into(),
            dest: dest.into(),
            source_map: None,
            emit_map: false,
        }
    }

    /// Contents as text. Invalid UTF-8 is a content problem of this record.
    pub fn text(&self) -> Result<&str, StageError> {
        std::str::from_utf8(&self.contents)
            .map_err(|err| StageError::content(format!("file is not valid UTF-8: {err}")))
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.contents = text.into().into_bytes();
    }

    pub fn set_extension(&mut self, extension: &str) {
        self.dest.set_extension(extension);
    }

    /// Terminal form of the record. The source map is serialized only if a
    /// stage decided it should be written.
    pub fn into_entry(self) -> Result<OutputEntry, TaskError> {
        let source_map = match (&self.source_map, self.emit_map) {
            (Some(map), true) => Some(map.to_json().map_err(anyhow::Error::from)?),
            _ => None,
        };

        Ok(OutputEntry {
            path: self.dest,
            bytes: self.contents,
            source_map,
        })
    }
}

/// A record-local transform.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::AbortPipeline
    }

    /// Destinations produced from a record headed for `dest`.
    fn plan(&self, dest: Utf8PathBuf) -> Vec<Utf8PathBuf> {
        vec![dest]
    }

    /// Turns one record into zero or more records.
    fn transform(&self, record: FileRecord) -> Result<Vec<FileRecord>, StageError>;
}

/// A transform over the complete upstream set.
///
/// Everything upstream is materialized before `gather` is called, so a
/// gather step ends the streaming part of a pipeline.
pub trait Gather: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::AbortPipeline
    }

    fn plan(&self, dests: Vec<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
        dests
    }

    fn gather(&self, records: Vec<FileRecord>) -> Result<Vec<FileRecord>, StageError>;
}

enum Step {
    Each(Box<dyn Stage>),
    All(Box<dyn Gather>),
}

type Flow<'a> = Box<dyn Iterator<Item = Result<FileRecord, TaskError>> + 'a>;

/// Source globs plus an ordered chain of steps, runnable as a leaf task.
///
/// Globs are relative to the source root of the [`Environment`]. Outputs land
/// in `dest` below the output root, keeping their path relative to the glob.
pub struct Pipeline {
    sources: Vec<String>,
    exclude: Vec<Pattern>,
    dest: Utf8PathBuf,
    steps: Vec<Step>,
    category: Category,
    ledger: Ledger,
}

impl Pipeline {
    pub fn new(sources: &[&str]) -> Result<Self, ConfigError> {
        for glob in sources {
            Pattern::new(glob)?;
        }

        Ok(Self {
            sources: sources.iter().map(|glob| glob.to_string()).collect(),
            exclude: Vec::new(),
            dest: Utf8PathBuf::new(),
            steps: Vec::new(),
            category: Category::Other,
            ledger: Ledger::default(),
        })
    }

    /// Drops matches whose relative path matches `pattern`.
    pub fn exclude(mut self, pattern: &str) -> Result<Self, ConfigError> {
        self.exclude.push(Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn dest(mut self, dest: impl Into<Utf8PathBuf>) -> Self {
        self.dest = dest.into();
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn then(mut self, stage: impl Stage + 'static) -> Self {
        self.steps.push(Step::Each(Box::new(stage)));
        self
    }

    pub fn gather(mut self, gather: impl Gather + 'static) -> Self {
        self.steps.push(Step::All(Box::new(gather)));
        self
    }

    fn globs(&self, env: &Environment) -> Vec<String> {
        self.sources.iter().map(|glob| env.glob(glob)).collect()
    }

    /// Runs the chain and returns the output set, without writing anything.
    pub fn execute(&self, ctx: &TaskContext<'_>) -> Result<Vec<OutputEntry>, TaskError> {
        let globs = self.globs(ctx.env);

        let mut flow: Flow<'_> = Box::new(source::scan(&globs, &self.exclude, &self.dest));
        for step in &self.steps {
            flow = match step {
                Step::Each(stage) => each(ctx, stage.as_ref(), flow),
                Step::All(gather) => all(ctx, gather.as_ref(), &self.dest, flow),
            };
        }

        let mut entries = Vec::new();
        for record in flow {
            entries.push(record?.into_entry()?);
        }

        check_unique(&entries)?;
        Ok(entries)
    }
}

impl Runnable for Pipeline {
    fn run(&self, ctx: &TaskContext<'_>) -> Result<Outcome, TaskError> {
        let s = Instant::now();
        let entries = self.execute(ctx)?;

        ctx.progress(format!("writing {} file(s)", entries.len()));
        let written = self.ledger.flush(&ctx.env.dist, &entries)?;

        tracing::debug!(
            "{}: {} output(s), {} changed {}",
            ctx.name,
            entries.len(),
            written.len(),
            as_overhead(s.elapsed())
        );

        Ok(Outcome { written })
    }

    fn category(&self) -> Category {
        self.category
    }

    fn plan(&self, env: &Environment) -> Result<Vec<Utf8PathBuf>, TaskError> {
        let globs = self.globs(env);

        let mut dests = Vec::new();
        for item in source::matches(&globs, &self.exclude) {
            let (_, relative) = item?;
            dests.push(self.dest.join(relative));
        }

        for step in &self.steps {
            dests = match step {
                Step::Each(stage) => dests
                    .into_iter()
                    .flat_map(|dest| stage.plan(dest))
                    .collect(),
                Step::All(gather) => gather.plan(dests),
            };
        }

        Ok(dests)
    }
}

/// Applies a stage's policy to a failure. Returns the error only if it has
/// to stop the pipeline.
fn absorb(
    ctx: &TaskContext<'_>,
    stage: &str,
    policy: ErrorPolicy,
    file: &Utf8Path,
    err: StageError,
) -> Option<TaskError> {
    match policy {
        ErrorPolicy::AbortPipeline => Some(TaskError::Stage {
            stage: stage.to_owned(),
            file: file.to_path_buf(),
            source: err,
        }),
        ErrorPolicy::SkipRecord => {
            tracing::debug!("{}/{stage}: skipped {file}: {err}", ctx.name);
            None
        }
        ErrorPolicy::DiagnoseAndContinue => {
            ctx.diagnose(Diagnostic::recoverable(ctx.name, stage, Some(file), err.to_string()));
            None
        }
    }
}

fn each<'a>(ctx: &'a TaskContext<'_>, stage: &'a dyn Stage, upstream: Flow<'a>) -> Flow<'a> {
    Box::new(upstream.flat_map(move |item| -> Vec<Result<FileRecord, TaskError>> {
        let record = match item {
            Ok(record) => record,
            Err(err) => return vec![Err(err)],
        };

        let source = record.source.clone();
        match stage.transform(record) {
            Ok(records) => records.into_iter().map(Ok).collect(),
            Err(err) => absorb(ctx, stage.name(), stage.policy(), &source, err)
                .map(Err)
                .into_iter()
                .collect(),
        }
    }))
}

fn all<'a>(
    ctx: &'a TaskContext<'_>,
    gather: &'a dyn Gather,
    dest: &'a Utf8Path,
    upstream: Flow<'a>,
) -> Flow<'a> {
    // nothing is pulled from upstream until the first gathered record is
    Box::new(std::iter::once(upstream).flat_map(
        move |upstream| -> Vec<Result<FileRecord, TaskError>> {
            let records = match upstream.collect::<Result<Vec<_>, _>>() {
                Ok(records) => records,
                Err(err) => return vec![Err(err)],
            };

            match gather.gather(records) {
                Ok(records) => records.into_iter().map(Ok).collect(),
                Err(err) => absorb(ctx, gather.name(), gather.policy(), dest, err)
                    .map(Err)
                    .into_iter()
                    .collect(),
            }
        },
    ))
}
