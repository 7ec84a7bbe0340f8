use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::StageError;
use crate::output::normalize_path;
use crate::pipeline::{ErrorPolicy, FileRecord, Stage};

const DIRECTIVE: &str = "@include(";

/// Expands `@include('path')` directives.
///
/// Paths are resolved against the directory of the including file and
/// included files are expanded recursively. A missing file or an include
/// cycle drops the page with a diagnostic.
#[derive(Debug, Default)]
pub struct Include;

impl Stage for Include {
    fn name(&self) -> &str {
        "include"
    }

    fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::DiagnoseAndContinue
    }

    fn transform(&self, mut record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
        let mut stack = vec![normalize_path(&record.source)];
        let text = expand(record.text()?, &record.source, &mut stack)?;
        record.set_text(text);
        Ok(vec![record])
    }
}

fn expand(text: &str, file: &Utf8Path, stack: &mut Vec<Utf8PathBuf>) -> Result<String, StageError> {
    let base = file.parent().unwrap_or(Utf8Path::new(""));
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(DIRECTIVE) {
        out.push_str(&rest[..start]);
        let (path, len) = parse_directive(&rest[start..])
            .ok_or_else(|| StageError::content(format!("malformed include in {file}")))?;

        let target = normalize_path(&base.join(path));
        if stack.contains(&target) {
            let chain: Vec<_> = stack.iter().map(|p| p.as_str()).collect();
            return Err(StageError::content(format!(
                "include cycle: {} -> {target}",
                chain.join(" -> ")
            )));
        }

        let included = fs::read_to_string(&target)
            .map_err(|err| StageError::content(format!("can't include {target}: {err}")))?;

        stack.push(target.clone());
        out.push_str(&expand(&included, &target, stack)?);
        stack.pop();

        rest = &rest[start + len..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Parses `@include('path')` at the start of `text`, returning the path and
/// the length of the directive.
fn parse_directive(text: &str) -> Option<(&str, usize)> {
    let args = &text[DIRECTIVE.len()..];
    let trimmed = args.trim_start();
    let quote = trimmed.chars().next().filter(|c| *c == '\'' || *c == '"')?;

    let body = &trimmed[1..];
    let end = body.find(quote)?;
    let path = &body[..end];

    let after = &body[end + 1..];
    let close = after.trim_start();
    if !close.starts_with(')') {
        return None;
    }

    let consumed = text.len() - close.len() + 1;
    Some((path, consumed))
}

/// Injects the client which listens to the reload channel on `port`.
#[derive(Debug)]
pub struct LiveReload {
    script: String,
}

impl LiveReload {
    pub fn new(port: u16) -> Self {
        Self {
            script: format!("<script>{}</script>", CLIENT.replace("__PORT__", &port.to_string())),
        }
    }
}

impl Stage for LiveReload {
    fn name(&self) -> &str {
        "livereload"
    }

    fn transform(&self, mut record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
        let text = record.text()?;

        let text = match text.rfind("</body>") {
            Some(at) => format!("{}{}{}", &text[..at], self.script, &text[at..]),
            None => format!("{text}{}", self.script),
        };

        record.set_text(text);
        Ok(vec![record])
    }
}

const CLIENT: &str = r#"(() => {
  const socket = new WebSocket("ws://localhost:__PORT__");
  socket.addEventListener("message", (event) => {
    const notice = JSON.parse(event.data);
    if (notice.kind !== "css") {
      window.location.reload();
      return;
    }
    const stamp = Date.now();
    for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {
      const url = new URL(link.href);
      url.searchParams.set("t", stamp);
      link.href = url.toString();
    }
  });
})();"#;
