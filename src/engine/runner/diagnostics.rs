use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use console::style;

/// How bad a [`Diagnostic`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// The offending record was dropped, everything else went on.
    Recoverable,
    /// The task failed.
    Fatal,
}

/// A single problem observed during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub task: String,
    pub stage: Option<String>,
    pub file: Option<Utf8PathBuf>,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    /// A content problem absorbed by a stage.
    pub fn recoverable(
        task: impl Into<String>,
        stage: impl Into<String>,
        file: Option<&Utf8Path>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task: task.into(),
            stage: Some(stage.into()),
            file: file.map(Utf8Path::to_path_buf),
            severity: Severity::Recoverable,
            message: message.into(),
        }
    }

    /// A failure which stopped the task.
    pub fn fatal(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            stage: None,
            file: None,
            severity: Severity::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}", self.task)?;
        if let Some(stage) = &self.stage {
            write!(f, "/{stage}")?;
        }
        write!(f, "]")?;
        if let Some(file) = &self.file {
            write!(f, " {file}:")?;
        }
        write!(f, " {}", self.message)
    }
}

/// Central collector of diagnostics.
///
/// Cloning is cheap and every clone feeds the same collection. In development
/// mode one sink lives as long as the process; a production build creates one
/// per invocation and derives the exit status from it.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    entries: Arc<Mutex<Vec<Diagnostic>>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Surfaces the diagnostic to the developer and keeps it.
    pub fn record(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Recoverable => tracing::warn!("{diagnostic}"),
            Severity::Fatal => tracing::error!("{diagnostic}"),
        }

        self.entries.lock().unwrap().push(diagnostic);
    }

    pub fn summarize(&self) -> Summary {
        let entries = self.entries.lock().unwrap().clone();
        let fatal = entries.iter().filter(|d| d.is_fatal()).count();

        Summary {
            fatal,
            recoverable: entries.len() - fatal,
            entries,
        }
    }
}

/// Counts of everything an [`ErrorSink`] has seen.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub fatal: usize,
    pub recoverable: usize,
    pub entries: Vec<Diagnostic>,
}

impl Summary {
    /// A run succeeds unless something fatal happened. Recoverable diagnostics
    /// are reported but never fail a build on their own.
    pub fn is_success(&self) -> bool {
        self.fatal == 0
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            let marker = match entry.severity {
                Severity::Recoverable => style("warning").yellow(),
                Severity::Fatal => style("error").red(),
            };
            writeln!(f, "{marker} {entry}")?;
        }

        write!(
            f,
            "{} fatal, {} recoverable",
            self.fatal, self.recoverable
        )
    }
}

/// Per-run view of the sink: collects what one run produced so it can be
/// handed back in the [`Report`](super::Report), while forwarding everything
/// to the shared sink as it happens.
pub(crate) struct Recorder<'a> {
    sink: &'a ErrorSink,
    local: Mutex<Vec<Diagnostic>>,
}

impl<'a> Recorder<'a> {
    pub(crate) fn new(sink: &'a ErrorSink) -> Self {
        Self {
            sink,
            local: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn record(&self, diagnostic: Diagnostic) {
        self.local.lock().unwrap().push(diagnostic.clone());
        self.sink.record(diagnostic);
    }

    pub(crate) fn into_inner(self) -> Vec<Diagnostic> {
        self.local.into_inner().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let sink = ErrorSink::new();
        sink.record(Diagnostic::recoverable(
            "styles",
            "sass",
            Some(Utf8Path::new("src/scss/broken.scss")),
            "expected \";\"",
        ));
        sink.record(Diagnostic::fatal("images", "permission denied"));

        let summary = sink.summarize();
        assert_eq!(summary.fatal, 1);
        assert_eq!(summary.recoverable, 1);
        assert!(!summary.is_success());
    }

    #[test]
    fn test_recoverable_only_is_success() {
        let sink = ErrorSink::new();
        sink.record(Diagnostic::recoverable("styles", "sass", None, "oops"));
        assert!(sink.summarize().is_success());
    }

    #[test]
    fn test_clones_share_entries() {
        let sink = ErrorSink::new();
        let other = sink.clone();
        other.record(Diagnostic::fatal("clean", "busy"));
        assert_eq!(sink.summarize().fatal, 1);
    }

    #[test]
    fn test_recorder_keeps_local_copy() {
        let sink = ErrorSink::new();
        let recorder = Recorder::new(&sink);
        recorder.record(Diagnostic::fatal("fonts", "missing"));

        assert_eq!(recorder.into_inner().len(), 1);
        assert_eq!(sink.summarize().entries.len(), 1);
    }

    #[test]
    fn test_display() {
        let diagnostic = Diagnostic::recoverable(
            "styles",
            "sass",
            Some(Utf8Path::new("src/scss/a.scss")),
            "bad",
        );
        assert_eq!(diagnostic.to_string(), "[styles/sass] src/scss/a.scss: bad");
        assert_eq!(Diagnostic::fatal("clean", "busy").to_string(), "[clean] busy");
    }
}
