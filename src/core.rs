use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

/// A 32-byte BLAKE3 hash used for change detection.
///
/// In `tsumugi`, this serves two purposes:
/// 1. It fingerprints every written output file so that a rebuild which
///    produces identical bytes neither touches the file nor triggers a reload.
/// 2. It names scratch files handed to external encoders, so concurrent
///    tasks never clash on a temporary path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// The mode in which the orchestrator is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A one-shot production build.
    Build,
    /// The development loop: build once, then watch, serve and reload.
    Watch,
}

/// Process-wide settings visible to every task.
///
/// Constructed once at startup (usually from the command line) and shared
/// read-only by the scheduler, the watcher and every running task.
#[derive(Debug, Clone)]
pub struct Environment {
    /// The current mode (Build or Watch).
    pub mode: Mode,
    /// Root of the source tree.
    pub src: Utf8PathBuf,
    /// Root of the output tree, shared by all tasks.
    pub dist: Utf8PathBuf,
    /// Port of the development HTTP server.
    pub port: u16,
    /// Port of the reload channel, once it is bound.
    pub reload_port: Option<u16>,
    /// Settling window used to coalesce file system events.
    pub debounce: Duration,
}

impl Environment {
    pub fn new(mode: Mode, src: impl Into<Utf8PathBuf>, dist: impl Into<Utf8PathBuf>) -> Self {
        Self {
            mode,
            src: src.into(),
            dist: dist.into(),
            port: 8080,
            reload_port: None,
            debounce: Duration::from_millis(250),
        }
    }

    /// Path below the source root.
    pub fn source(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.src.join(path)
    }

    /// Glob string below the source root.
    pub fn glob(&self, pattern: &str) -> String {
        format!("{}/{}", self.src.as_str().trim_end_matches('/'), pattern)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(Mode::Build, "src", "app")
    }
}
