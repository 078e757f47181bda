//! Scrutiny, an always-on codebase monitor.
//!
//! Given a project directory, the engine maintains an up-to-date cached
//! report for every (file, tool) pair: a matrix of result cells fed by a
//! filesystem watcher and drained by a pool of niced worker subprocesses,
//! with all state snapshotted to a `.scrutiny/` cache directory inside the
//! project. Reports survive restarts; only work invalidated by file, tool
//! or engine changes is redone.
//!
//! The crate is the engine core. Rendering, argument parsing and the HTML
//! export surface consume it through [`Engine`]'s events and accessors.

#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;

pub mod cell;
pub mod compression;
pub mod engine;
pub mod events;
pub mod log;
pub mod matrix;
pub mod paged;
pub mod scheduler;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod tools;
pub mod utils;
pub mod watcher;
pub mod worker;

pub use cell::ResultCell;
pub use compression::Compression;
pub use engine::{default_worker_count, Engine, EngineConfig};
pub use error::{EngineError, Result};
pub use matrix::{Entry, SortOrder, Summary};
pub use status::Status;
pub use store::{Report, ReportStore};
pub use tools::{Tool, ToolRegistry};
pub use utils::RelPath;

/// Name of the cache directory created under the project root.
pub const CACHE_DIR_NAME: &str = ".scrutiny";
