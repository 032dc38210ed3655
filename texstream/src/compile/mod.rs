//! The compile orchestrator: drives resolver, fetchers, VFS, and engine,
//! and recovers from missing-file failures by fetching whatever the failed
//! attempt turned out to need.

mod diagnose;
mod orchestrator;
mod source;

use std::collections::HashMap;

use thiserror::Error;

use crate::cache::CacheError;
use crate::engine::{Engine, EngineError};

pub use diagnose::{file_to_package, find_missing_file};
pub use orchestrator::Orchestrator;
pub use source::{body_from_begin_document, preamble_of, rewrite_for_sandbox};

/// Retry bound for one compile.
pub const MAX_RETRIES: u32 = 10;

/// Operation caps, enforced by the orchestrator around (never inside)
/// engine invocations and fetches.
pub const PACKAGE_FETCH_TIMEOUT_SECS: u64 = 60;
pub const RANGE_FETCH_TIMEOUT_SECS: u64 = 30;
pub const COMPILE_TIMEOUT_SECS: u64 = 120;
pub const FORMAT_TIMEOUT_SECS: u64 = 300;

/// Options for one compile call.
#[derive(Clone)]
pub struct CompileOptions {
    /// Engine to use; `None` selects by source inspection.
    pub engine: Option<Engine>,
    /// Consult the PDF, aux, and format caches. Defaults to true.
    pub use_cache: bool,
    /// Extra files mounted into the VFS before the engine runs.
    pub additional_files: HashMap<String, Vec<u8>>,
}

impl CompileOptions {
    pub fn new() -> Self {
        Self {
            engine: None,
            use_cache: true,
            additional_files: HashMap::new(),
        }
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one compile call.
#[derive(Debug, Clone, Default)]
pub struct CompileStats {
    pub attempts: u32,
    pub bytes_read: u64,
    pub files_read: u64,
    pub bundles_mounted: usize,
    pub packages_fetched: usize,
    pub ranges_fetched: usize,
    pub used_format: bool,
    pub duration_ms: u64,
}

/// Result of one compile call. `success == false` carries the exit code
/// and the captured engine log.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub success: bool,
    pub pdf: Option<Vec<u8>>,
    pub exit_code: Option<i32>,
    pub log: Option<String>,
    pub stats: CompileStats,
    pub cached: bool,
}

/// Terminal orchestrator errors. Ordinary engine failures are not errors:
/// they surface as a `CompileOutput` with `success == false`.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{what} cap exceeded")]
    CapExceeded { what: String, log: String },

    #[error("format generation failed: {0}")]
    FormatFailed(String),

    #[error("service terminated")]
    Terminated,
}
