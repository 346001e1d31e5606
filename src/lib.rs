//! # tabledger
//!
//! An audited staging ledger for tabular data. Source rows are merged into
//! typed staging tables one run at a time; every run is recorded as a change
//! event with per-row before/after documents, protected-field conflicts are
//! held back for review, and any event (or every event after a point in
//! time) can be reversed.

pub mod archive;
pub mod audit;
pub mod cli;
pub mod commands;
pub mod config;
pub mod data;
pub mod diff;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod merge;
pub mod output;
pub mod progress;
pub mod resolver;
pub mod rollback;
pub mod row;
pub mod state;
pub mod store;
pub mod verify;
pub mod workspace;

pub use error::{Result, TabledgerError};
pub use ledger::{Ledger, RunOptions, RunResult};
pub use workspace::LedgerWorkspace;

/// Current format version for ledger configuration and archives
pub const FORMAT_VERSION: &str = "1.0.0";

/// Default number of row changes per diff page
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Default number of sample keys kept per outcome in run summaries
pub const DEFAULT_SAMPLE_SIZE: usize = 25;

/// Actor recorded when none is given
pub const DEFAULT_ACTOR: &str = "cli";
