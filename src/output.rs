//! Output entries and the shared output tree.
//!
//! This module contains the [`OutputEntry`] struct, the terminal form of a
//! pipeline record, and the helpers which flush entries to the output root.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::sync::Mutex;
use std::time::Instant;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::engine::{Outcome, Runnable, TaskContext};
use crate::error::TaskError;

/// A single file to be written below the output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    /// Destination path, relative to the output root.
    pub path: Utf8PathBuf,
    /// The content of the file to be written.
    pub bytes: Vec<u8>,
    /// Serialized source map, written next to the file with a `.map` suffix.
    pub source_map: Option<String>,
}

impl OutputEntry {
    pub fn new(path: impl Into<Utf8PathBuf>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
            source_map: None,
        }
    }

    /// Path of the accompanying source map.
    pub fn map_path(&self) -> Utf8PathBuf {
        map_path(&self.path)
    }

    /// Every path this entry occupies in the output tree.
    pub fn paths(&self) -> impl Iterator<Item = Utf8PathBuf> + '_ {
        let map = self.source_map.as_ref().map(|_| self.map_path());
        std::iter::once(self.path.clone()).chain(map)
    }
}

pub(crate) fn map_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut name = path.as_str().to_owned();
    name.push_str(".map");
    Utf8PathBuf::from(name)
}

/// Fails if two entries of the same output set share a destination.
pub(crate) fn check_unique(entries: &[OutputEntry]) -> Result<(), TaskError> {
    let mut seen = HashSet::new();

    for path in entries.iter().flat_map(OutputEntry::paths) {
        if !seen.insert(path.clone()) {
            return Err(TaskError::DuplicateOutput(path));
        }
    }

    Ok(())
}

/// Content hashes of everything a task has written so far.
///
/// A rebuild which produces identical bytes leaves the file untouched and is
/// not reported as a change, so it never causes a browser reload.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    written: Mutex<HashMap<Utf8PathBuf, Hash32>>,
}

impl Ledger {
    /// Writes all entries below `dist` and returns the paths that changed.
    pub(crate) fn flush(
        &self,
        dist: &Utf8Path,
        entries: &[OutputEntry],
    ) -> io::Result<Vec<Utf8PathBuf>> {
        let mut written = self.written.lock().unwrap();
        let mut changed = Vec::new();

        for entry in entries {
            let mut files = vec![(entry.path.clone(), entry.bytes.as_slice())];
            if let Some(map) = &entry.source_map {
                files.push((entry.map_path(), map.as_bytes()));
            }

            for (path, bytes) in files {
                let hash = Hash32::hash(bytes);
                let target = dist.join(&path);

                if written.get(&path) == Some(&hash) && target.is_file() {
                    continue;
                }

                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }

                fs::write(&target, bytes)?;
                written.insert(path.clone(), hash);
                changed.push(path);
            }
        }

        Ok(changed)
    }
}

/// Empties the output root, creating it if it does not exist yet.
///
/// This is the first task of both canonical pipelines; every later task may
/// assume it starts from an empty tree.
#[derive(Debug, Default)]
pub struct Clean;

impl Runnable for Clean {
    fn run(&self, ctx: &TaskContext<'_>) -> Result<Outcome, TaskError> {
        let s = Instant::now();
        let dist = &ctx.env.dist;

        if fs::metadata(dist).is_ok() {
            fs::remove_dir_all(dist)?;
        }

        fs::create_dir_all(dist)?;

        tracing::debug!("cleaned {} {}", dist, crate::utils::as_overhead(s.elapsed()));

        Ok(Outcome::default())
    }
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
/// This may cause incorrect or surprising behavior at times. This should be
/// used carefully.
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}
