#![forbid(unsafe_code)]

//! Runtime configuration and offline inspection of index state.
//!
//! [`FolioConfig`] is what a process needs to open its indexes. The
//! inspection functions read a state file and its page cache without
//! starting a queue, for the `folio-inspect` binary and for tests.

mod inspect;
mod options;

/// Configuration loading and defaults.
pub use options::{default_cache_dir, default_config_path, FolioConfig, DEFAULT_PAGE_SIZE};

/// State-file reports: summary, tree verification and pending events.
pub use inspect::{
    pending, summary, tree_dir_for, verify, PendingReport, SummaryReport, TreeSummary,
    VerifyFinding, VerifyReport,
};
