//! rangesync - Delta Downloads over HTTP Ranges
//!
//! This library reconstructs a remote file locally by reusing blocks found
//! in seed files and fetching only the missing byte ranges over HTTP, driven
//! by a small control file of per-block checksums. The companion generator
//! produces that control file from a local file.

pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod controlfile;
pub mod error;
pub mod events;
pub mod fetch;
pub mod index;
pub mod planner;
pub mod receive;
pub mod scanner;
pub mod seed;
pub mod store;

pub use client::{CancelToken, UpdateClient, UpdateOptions, UpdateStats};
pub use config::Config;
pub use controlfile::{ControlFile, FileMaker};
pub use error::{Error, Result};
pub use events::{EventSink, QueueSink, Severity, StatusEvent};
