//! SVG "stack" sprites.
//!
//! Every icon becomes a nested `<svg>` keyed by its file stem. The sprite's
//! stylesheet hides all icons except the `:target`, so `sprite.svg#logo`
//! renders just the `logo` icon.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::error::StageError;
use crate::pipeline::{ErrorPolicy, FileRecord, Gather, Stage};

const HEADER: &str = concat!(
    r#"<?xml version="1.0" encoding="utf-8"?>"#,
    r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink">"#,
    r#"<style>:root>svg{display:none}:root>svg:target{display:block}</style>"#,
);

/// Rewrites a standalone SVG document into a sprite member.
///
/// The root element keeps its attributes, except namespace declarations and
/// `id`, which is replaced by the file stem. Icons which are not SVG are
/// dropped with a diagnostic.
#[derive(Debug, Default)]
pub struct SvgIcon;

impl Stage for SvgIcon {
    fn name(&self) -> &str {
        "svg-icon"
    }

    fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::DiagnoseAndContinue
    }

    fn transform(&self, mut record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
        let id = record
            .source
            .file_stem()
            .ok_or_else(|| StageError::content("icon has no file name"))?
            .to_owned();

        let (attrs, inner) = parse_root(record.text()?)?;

        let mut icon = format!(r#"<svg id="{id}""#);
        for (name, value) in attrs {
            if name == "id" || name == "xmlns" || name.starts_with("xmlns:") {
                continue;
            }
            icon.push_str(&format!(r#" {name}="{value}""#));
        }
        icon.push('>');
        icon.push_str(inner.trim());
        icon.push_str("</svg>");

        record.set_text(icon);
        Ok(vec![record])
    }
}

/// Merges all icons into a single document at `dest`.
#[derive(Debug)]
pub struct Sprite {
    dest: Utf8PathBuf,
}

impl Sprite {
    pub fn new(dest: impl Into<Utf8PathBuf>) -> Self {
        Self { dest: dest.into() }
    }
}

impl Gather for Sprite {
    fn name(&self) -> &str {
        "sprite"
    }

    fn plan(&self, dests: Vec<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
        match dests.is_empty() {
            true => Vec::new(),
            false => vec![self.dest.clone()],
        }
    }

    fn gather(&self, records: Vec<FileRecord>) -> Result<Vec<FileRecord>, StageError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut icons = BTreeMap::new();
        for record in records {
            let stem = record.source.file_stem().unwrap_or_default().to_owned();
            if let Some(other) = icons.insert(stem.clone(), record) {
                return Err(StageError::content(format!(
                    "icon '{stem}' is defined more than once ({})",
                    other.source
                )));
            }
        }

        let mut text = String::from(HEADER);
        for record in icons.values() {
            text.push_str(record.text()?);
        }
        text.push_str("</svg>");

        let source = self.dest.clone();
        let relative = Utf8PathBuf::from(self.dest.file_name().unwrap_or_default());
        Ok(vec![FileRecord::new(source, relative, text, self.dest.clone())])
    }
}

type Attributes<'a> = Vec<(&'a str, &'a str)>;

/// Finds the root `<svg>` element, returning its attributes and content.
fn parse_root(text: &str) -> Result<(Attributes<'_>, &str), StageError> {
    let start = text
        .match_indices("<svg")
        .map(|(at, _)| at)
        .find(|&at| {
            text[at + 4..]
                .chars()
                .next()
                .is_some_and(|c| c.is_whitespace() || c == '>' || c == '/')
        })
        .ok_or_else(|| StageError::content("no <svg> root element"))?;

    let tag = &text[start + 4..];
    let mut quote = None;
    let end = tag
        .char_indices()
        .find(|&(_, c)| match quote {
            Some(q) if c == q => {
                quote = None;
                false
            }
            Some(_) => false,
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                false
            }
            None => c == '>',
        })
        .map(|(at, _)| at)
        .ok_or_else(|| StageError::content("unterminated <svg> tag"))?;

    let (head, self_closing) = match tag[..end].strip_suffix('/') {
        Some(head) => (head, true),
        None => (&tag[..end], false),
    };

    let attrs = parse_attributes(head)?;

    if self_closing {
        return Ok((attrs, ""));
    }

    let body = &tag[end + 1..];
    let close = body
        .rfind("</svg>")
        .ok_or_else(|| StageError::content("missing </svg>"))?;

    Ok((attrs, &body[..close]))
}

fn parse_attributes(mut rest: &str) -> Result<Attributes<'_>, StageError> {
    let mut attrs = Vec::new();

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Ok(attrs);
        }

        let eq = rest
            .find('=')
            .ok_or_else(|| StageError::content(format!("malformed attribute near '{rest}'")))?;
        let name = rest[..eq].trim();

        let value = rest[eq + 1..].trim_start();
        let quote = value
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| StageError::content(format!("unquoted attribute '{name}'")))?;

        let value = &value[1..];
        let end = value
            .find(quote)
            .ok_or_else(|| StageError::content(format!("unterminated attribute '{name}'")))?;

        attrs.push((name, &value[..end]));
        rest = &value[end + 1..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icon(name: &str, text: &str) -> FileRecord {
        FileRecord::new(format!("src/images/svg/{name}"), name, text, format!("images/{name}"))
    }

    #[test]
    fn test_icon_is_rekeyed() {
        let record = icon(
            "logo.svg",
            r#"<?xml version="1.0"?><!-- x --><svg xmlns="http://www.w3.org/2000/svg" id="old" viewBox='0 0 10 10'><path d="M0 0h10"/></svg>"#,
        );

        let out = SvgIcon.transform(record).unwrap();
        assert_eq!(
            out[0].text().unwrap(),
            r#"<svg id="logo" viewBox="0 0 10 10"><path d="M0 0h10"/></svg>"#
        );
    }

    #[test]
    fn test_not_svg() {
        assert!(matches!(
            SvgIcon.transform(icon("x.svg", "<svgx></svgx>")),
            Err(StageError::Content(_))
        ));
    }

    #[test]
    fn test_self_closing_root() {
        let out = SvgIcon.transform(icon("dot.svg", r#"<svg width="1"/>"#)).unwrap();
        assert_eq!(out[0].text().unwrap(), r#"<svg id="dot" width="1"></svg>"#);
    }

    #[test]
    fn test_sprite_is_sorted_by_stem() {
        let records = vec![
            icon("b.svg", r#"<svg id="b"></svg>"#),
            icon("a.svg", r#"<svg id="a"></svg>"#),
        ];

        let out = Sprite::new("images/sprite.svg").gather(records).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dest, "images/sprite.svg");

        let text = out[0].text().unwrap();
        assert!(text.starts_with(HEADER));
        assert!(text.ends_with(r#"<svg id="a"></svg><svg id="b"></svg></svg>"#));
    }

    #[test]
    fn test_empty_set_yields_nothing() {
        let sprite = Sprite::new("images/sprite.svg");
        assert!(sprite.gather(Vec::new()).unwrap().is_empty());
        assert!(sprite.plan(Vec::new()).is_empty());
    }
}
