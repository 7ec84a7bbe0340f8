use thiserror::Error;

use crate::error::StageError;
use crate::pipeline::sourcemap::SourceMap;
use crate::pipeline::{ErrorPolicy, FileRecord, Stage};

/// Errors that can occur when compiling stylesheets.
#[derive(Debug, Error)]
pub enum StyleError {
    /// A Sass compilation error occurred.
    #[error("Sass compilation error: {0}")]
    Sass(#[from] Box<grass::Error>),
}

impl From<StyleError> for StageError {
    fn from(err: StyleError) -> Self {
        StageError::content(err.to_string())
    }
}

/// Compiles SCSS to CSS with `grass`.
///
/// Imports are resolved relative to the compiled file. A stylesheet which
/// fails to compile is dropped with a diagnostic; the others still build.
/// Expanded output carries a source map pointing back at the SCSS source.
#[derive(Debug, Clone, Copy)]
pub struct Sass {
    compressed: bool,
}

impl Sass {
    pub fn expanded() -> Self {
        Self { compressed: false }
    }

    pub fn compressed() -> Self {
        Self { compressed: true }
    }

    fn compile(&self, record: &FileRecord) -> Result<String, StageError> {
        let style = match self.compressed {
            true => grass::OutputStyle::Compressed,
            false => grass::OutputStyle::Expanded,
        };

        let mut options = grass::Options::default().style(style);
        if let Some(dir) = record.source.parent() {
            options = options.load_path(dir);
        }

        let css = grass::from_string(record.text()?.to_owned(), &options)
            .map_err(StyleError::from)?;
        Ok(css)
    }
}

impl Stage for Sass {
    fn name(&self) -> &str {
        "sass"
    }

    fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::DiagnoseAndContinue
    }

    fn plan(&self, mut dest: camino::Utf8PathBuf) -> Vec<camino::Utf8PathBuf> {
        dest.set_extension("css");
        vec![dest]
    }

    fn transform(&self, mut record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
        let css = self.compile(&record)?;

        record.set_extension("css");
        if !self.compressed {
            let file = record.dest.file_name().unwrap_or_default().to_owned();
            let map = SourceMap::opaque(file, record.relative.as_str(), record.text()?);
            record.source_map = Some(map);
        }
        record.set_text(css);

        Ok(vec![record])
    }
}
