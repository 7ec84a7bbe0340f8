use std::collections::HashSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

use crate::error::TaskError;
use crate::pipeline::FileRecord;

/// `*` never crosses a directory boundary; only `**` does.
pub(crate) const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Splits a glob into its static root and the wildcard suffix.
///
/// `src/scss/**/*.scss` becomes (`src/scss`, `**/*.scss`). A glob without
/// wildcards has an empty suffix.
pub(crate) fn split_glob(glob: &str) -> (Utf8PathBuf, Utf8PathBuf) {
    let path = Utf8Path::new(glob);

    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix: Utf8PathBuf = components.iter().skip(split_idx).collect();

    (root, suffix)
}

/// Directory that relative paths of matches are computed against.
fn base_of(glob: &str) -> Utf8PathBuf {
    let (root, suffix) = split_glob(glob);

    if suffix.as_str().is_empty() {
        root.parent().map(Utf8Path::to_path_buf).unwrap_or_default()
    } else {
        root
    }
}

/// Lazily lists `(source, relative)` pairs of all files matched by `globs`,
/// minus the `exclude` patterns (which match against the relative path).
///
/// Files matched by more than one glob are listed once, in the order of the
/// first glob that matched them.
pub(crate) fn matches<'a>(
    globs: &'a [String],
    exclude: &'a [Pattern],
) -> impl Iterator<Item = Result<(Utf8PathBuf, Utf8PathBuf), TaskError>> + 'a {
    let mut seen = HashSet::new();

    globs
        .iter()
        .flat_map(|glob| {
            let base = base_of(glob);

            let paths: Box<dyn Iterator<Item = Result<(Utf8PathBuf, Utf8PathBuf), TaskError>>> =
                match glob::glob_with(glob, MATCH) {
                    Ok(paths) => Box::new(paths.filter_map(move |path| {
                        let path = match path.map_err(TaskError::from).and_then(|path| {
                            Utf8PathBuf::try_from(path).map_err(TaskError::from)
                        }) {
                            Ok(path) => path,
                            Err(err) => return Some(Err(err)),
                        };

                        if !path.is_file() {
                            return None;
                        }

                        let relative = match path.strip_prefix(&base) {
                            Ok(relative) => relative.to_path_buf(),
                            Err(_) => Utf8PathBuf::from(path.file_name().unwrap_or_default()),
                        };

                        Some(Ok((path, relative)))
                    })),
                    Err(err) => Box::new(std::iter::once(Err(TaskError::from(err)))),
                };

            paths
        })
        .filter(move |item| match item {
            Ok((_, relative)) => !exclude
                .iter()
                .any(|pattern| pattern.matches_with(relative.as_str(), MATCH)),
            Err(_) => true,
        })
        .filter(move |item| match item {
            Ok((source, _)) => seen.insert(source.clone()),
            Err(_) => true,
        })
}

/// Lazily reads every matched file into a [`FileRecord`] destined for `dest`.
///
/// Nothing is read until the consumer pulls the next record.
pub(crate) fn scan<'a>(
    globs: &'a [String],
    exclude: &'a [Pattern],
    dest: &'a Utf8Path,
) -> impl Iterator<Item = Result<FileRecord, TaskError>> + 'a {
    matches(globs, exclude).map(move |item| {
        let (source, relative) = item?;
        let contents = fs::read(&source)?;
        let dest = dest.join(&relative);

        Ok(FileRecord::new(source, relative, contents, dest))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_glob() {
        let (root, suffix) = split_glob("src/scss/**/*.scss");
        assert_eq!(root, "src/scss");
        assert_eq!(suffix, "**/*.scss");

        let (root, suffix) = split_glob("src/js/main.js");
        assert_eq!(root, "src/js/main.js");
        assert_eq!(suffix, "");
    }

    #[test]
    fn test_base_of_concrete_file_is_parent() {
        assert_eq!(base_of("src/js/main.js"), "src/js");
        assert_eq!(base_of("src/images/*.png"), "src/images");
    }

    #[test]
    fn test_scan_reads_relative_paths_and_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(root.join("scss/blocks")).unwrap();
        fs::write(root.join("scss/main.scss"), "a{}").unwrap();
        fs::write(root.join("scss/_vars.scss"), "$a: 1;").unwrap();
        fs::write(root.join("scss/blocks/card.scss"), "b{}").unwrap();

        let globs = vec![format!("{root}/scss/**/*.scss")];
        let exclude = vec![Pattern::new("**/_*.scss").unwrap()];

        let records: Vec<_> = scan(&globs, &exclude, Utf8Path::new("css"))
            .collect::<Result<_, _>>()
            .unwrap();

        let mut relative: Vec<_> = records.iter().map(|r| r.relative.as_str()).collect();
        relative.sort();
        assert_eq!(relative, vec!["blocks/card.scss", "main.scss"]);

        let main = records.iter().find(|r| r.relative == "main.scss").unwrap();
        assert_eq!(main.dest, "css/main.scss");
        assert_eq!(main.contents, b"a{}");
    }

    #[test]
    fn test_overlapping_globs_yield_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("logo.png"), [0u8]).unwrap();

        let globs = vec![format!("{root}/*.png"), format!("{root}/logo.*")];
        let found: Vec<_> = matches(&globs, &[]).collect::<Result<_, _>>().unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_single_star_stays_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(root.join("images/svg")).unwrap();
        fs::write(root.join("images/a.svg"), "<svg/>").unwrap();
        fs::write(root.join("images/svg/icon.svg"), "<svg/>").unwrap();

        let globs = vec![format!("{root}/images/*.svg")];
        let found: Vec<_> = matches(&globs, &[]).collect::<Result<_, _>>().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, "a.svg");
    }
}
