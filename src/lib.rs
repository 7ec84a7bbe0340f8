#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod core;
mod engine;
mod error;
pub mod loader;
mod output;
pub mod pipeline;
mod utils;

pub use crate::blueprint::{Blueprint, Website};
pub use crate::core::{Environment, Mode};
pub use crate::engine::{
    Category, Change, Diagnostic, ErrorSink, Handle, Outcome, Report, Runnable, Severity, Summary,
    TaskContext,
};
pub use crate::engine::runner::TaskExecution;
pub use crate::error::*;
pub use crate::output::{Clean, OutputEntry};
pub use crate::pipeline::sourcemap::{SourceMap, SourceMaps};
pub use crate::pipeline::{ErrorPolicy, FileRecord, Gather, Pipeline, Stage};

#[cfg(feature = "live")]
pub use crate::engine::runner::reload::{DEFAULT_PORT as DEFAULT_RELOAD_PORT, Peer, ReloadBus};
#[cfg(feature = "live")]
pub use crate::engine::runner::watch::{StopHandle, Watcher};

#[cfg(feature = "server")]
pub use crate::engine::runner::http::start as serve;

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

/// Result type of closure-backed tasks registered with [`Blueprint::task`].
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;
