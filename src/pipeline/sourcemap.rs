use camino::Utf8PathBuf;
use serde::Serialize;

use crate::error::StageError;
use crate::pipeline::{ErrorPolicy, FileRecord, Stage};

/// A version 3 source map.
///
/// Field order is fixed and no timestamps are embedded, so identical inputs
/// always serialize to identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMap {
    pub version: u8,
    pub file: String,
    pub sources: Vec<String>,
    #[serde(rename = "sourcesContent")]
    pub sources_content: Vec<String>,
    pub names: Vec<String>,
    pub mappings: String,
}

impl SourceMap {
    /// A map where generated line N comes from source line N.
    pub fn identity(file: impl Into<String>, source: impl Into<String>, content: &str) -> Self {
        let lines = content.lines().count().max(1);

        // first segment: column 0, source 0, line 0, column 0; every next
        // line advances the source line by one
        let mut mappings = String::from("AAAA");
        for _ in 1..lines {
            mappings.push_str(";AACA");
        }

        Self {
            version: 3,
            file: file.into(),
            sources: vec![source.into()],
            sources_content: vec![content.to_owned()],
            names: Vec::new(),
            mappings,
        }
    }

    /// A map which only records where the output came from.
    pub fn opaque(file: impl Into<String>, source: impl Into<String>, content: &str) -> Self {
        Self {
            version: 3,
            file: file.into(),
            sources: vec![source.into()],
            sources_content: vec![content.to_owned()],
            names: Vec::new(),
            mappings: String::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Writes attached source maps next to their files.
///
/// Appends the `sourceMappingURL` comment to every record carrying a map and
/// marks the map for output as `<dest>.map`. Records without a map pass
/// through untouched.
#[derive(Debug, Default)]
pub struct SourceMaps;

impl Stage for SourceMaps {
    fn name(&self) -> &str {
        "sourcemaps"
    }

    fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::AbortPipeline
    }

    fn plan(&self, dest: Utf8PathBuf) -> Vec<Utf8PathBuf> {
        let map = crate::output::map_path(&dest);
        vec![dest, map]
    }

    fn transform(&self, mut record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
        if record.source_map.is_none() {
            return Ok(vec![record]);
        }

        let name = format!("{}.map", record.dest.file_name().unwrap_or_default());
        let comment = match record.dest.extension() {
            Some("css") => format!("\n/*# sourceMappingURL={name} */\n"),
            _ => format!("\n//# sourceMappingURL={name}\n"),
        };

        let mut text = record.text()?.trim_end().to_owned();
        text.push_str(&comment);
        record.set_text(text);
        record.emit_map = true;

        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_mappings() {
        let map = SourceMap::identity("main.js", "main.js", "let a = 1;\nlet b = 2;\nlet c = 3;");
        assert_eq!(map.mappings, "AAAA;AACA;AACA");
        assert_eq!(
            map.to_json().unwrap(),
            r#"{"version":3,"file":"main.js","sources":["main.js"],"sourcesContent":["let a = 1;\nlet b = 2;\nlet c = 3;"],"names":[],"mappings":"AAAA;AACA;AACA"}"#
        );
    }

    #[test]
    fn test_write_appends_comment() {
        let mut record =
            FileRecord::new("src/scss/main.scss", "main.scss", "a{b:c}", "css/main.css");
        record.source_map = Some(SourceMap::opaque("main.css", "main.scss", "a{b:c}"));

        let out = SourceMaps.transform(record).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text().unwrap(), "a{b:c}\n/*# sourceMappingURL=main.css.map */\n");

        let entry = out.into_iter().next().unwrap().into_entry().unwrap();
        assert_eq!(entry.map_path(), "css/main.css.map");
        assert!(entry.source_map.unwrap().contains("\"file\":\"main.css\""));
    }

    #[test]
    fn test_records_without_map_pass_through() {
        let record = FileRecord::new("src/js/main.js", "main.js", "x()", "js/main.js");
        let out = SourceMaps.transform(record).unwrap();
        assert_eq!(out[0].text().unwrap(), "x()");
        assert!(out[0].clone().into_entry().unwrap().source_map.is_none());
    }
}
