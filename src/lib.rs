//! cratekeep: content-addressed filesystem backup ingest.
//!
//! Walks a directory tree, fixed-size chunks every regular file, stores each
//! chunk once under its BLAKE3 fingerprint, and records the resulting
//! snapshot (files, chunk lists, counters) in a SQLite catalog. The
//! [`coordinator::IngestCoordinator`] is the single entry point that owns a
//! run end to end; [`config::IngestOptions`] (built via
//! [`config::IngestOptions::builder`] or [`cli::Cli::build_options`])
//! configures it.

pub mod buffer_pool;
pub mod catalog;
pub mod chunker;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod disk_detect;
pub mod error;
pub mod hash;
pub mod logging;
pub mod persistence;
pub mod progress;
pub mod scanner;
pub mod store;
pub mod utils;
pub mod workerpool;

pub use config::{IngestOptions, IngestOptionsBuilder};
pub use coordinator::{IngestCoordinator, IngestReport};
pub use error::{ErrorKind, IngestError, Result};
