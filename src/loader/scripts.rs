use crate::error::StageError;
use crate::pipeline::sourcemap::SourceMap;
use crate::pipeline::{FileRecord, Stage};

/// Attaches a line-for-line source map to a script emitted unchanged.
///
/// Browsers then show the original file name and content in their
/// debuggers, even though the served file lives below the output root.
#[derive(Debug, Default)]
pub struct IdentityMap;

impl Stage for IdentityMap {
    fn name(&self) -> &str {
        "identity-map"
    }

    fn transform(&self, mut record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
        let file = record.dest.file_name().unwrap_or_default().to_owned();
        let map = SourceMap::identity(file, record.relative.as_str(), record.text()?);

        record.source_map = Some(map);
        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sourcemap::SourceMaps;

    #[test]
    fn test_script_gets_map_and_comment() {
        let text = "const a = 1;\nconsole.log(a);\n";
        let record = FileRecord::new("src/js/main.js", "main.js", text, "js/main.js");

        let out = IdentityMap.transform(record).unwrap();
        let out = SourceMaps.transform(out.into_iter().next().unwrap()).unwrap();
        let entry = out.into_iter().next().unwrap().into_entry().unwrap();

        assert_eq!(
            String::from_utf8(entry.bytes).unwrap(),
            "const a = 1;\nconsole.log(a);\n//# sourceMappingURL=main.js.map\n"
        );

        let map = entry.source_map.unwrap();
        assert!(map.contains(r#""mappings":"AAAA;AACA""#), "{map}");
        assert!(map.contains(r#""sources":["main.js"]"#), "{map}");
    }
}
