//! Parallel ingestion of trace files into a columnar store.
//!
//! # Architecture
//!
//! ```text
//! input 1 ─► reader-0 ─┐
//! input 2 ─► reader-1 ─┼─► bounded chunk channel ─► store writer ─► store
//! input N ─► reader-N ─┘        (queue_size)          (caller thread)
//! ```
//!
//! Each reader thread streams its file line by line, encodes records and
//! publishes them in chunks of `chunk_size`. Publishing blocks while the
//! channel holds `queue_size` messages, which bounds buffered memory to
//! roughly `queue_size × chunk_size` records however large the inputs are.
//!
//! Every reader finishes by redeeming a [`CompletionToken`]; a reader that
//! errors or panics drops its token unredeemed, which the writer observes as a
//! failure instead of waiting forever. Any fatal error cancels the remaining
//! readers and aborts the store.
//!
//! # Example
//!
//! ```rust,ignore
//! use tracestore::ingest::{ingest, IngestConfig};
//!
//! let config = IngestConfig::new("traces.trs", vec!["a.jsonl".into(), "b.jsonl".into()])
//!     .with_chunk_size(2000);
//! let report = ingest(&config)?;
//! println!("{} rows in {:?}", report.rows, report.elapsed);
//! ```

mod channel;
mod pipeline;
mod producer;

pub use channel::{
    chunk_channel, Chunk, ChunkMessage, ChunkReceiver, ChunkSender, CompletionToken, Received,
    ReaderId, ReaderSummary, TryPublish,
};
pub use pipeline::{ingest, IngestReport};
pub use producer::TraceProducer;

use crate::error::{Result, TraceStoreError};
use crate::store::StoreConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of records per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 5000;

/// Default channel capacity in chunks.
pub const DEFAULT_QUEUE_SIZE: usize = 3;

/// What a reader does with a line that cannot be decoded or encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Fail the reader, which aborts the whole pipeline (default).
    #[default]
    Abort,
    /// Log the line, count it as skipped and continue.
    Skip,
}

/// Configuration for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Store file to create (truncated if it exists).
    pub store_path: PathBuf,
    /// Newline-delimited JSON inputs, one reader each. `.gz` files are decompressed.
    pub inputs: Vec<PathBuf>,
    /// Records per chunk. Default: 5000.
    pub chunk_size: usize,
    /// Channel capacity in chunks. Default: 3.
    pub queue_size: usize,
    /// Handling of malformed lines. Default: abort.
    pub malformed: MalformedPolicy,
    /// Longest the writer waits for any message before failing. Default: none.
    pub stall_timeout: Option<Duration>,
    /// Store settings.
    pub store: StoreConfig,
}

impl IngestConfig {
    /// Creates a configuration with default sizes.
    pub fn new(store_path: impl Into<PathBuf>, inputs: Vec<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            inputs,
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            malformed: MalformedPolicy::default(),
            stall_timeout: None,
            store: StoreConfig::default(),
        }
    }

    /// Sets the number of records per chunk.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the channel capacity in chunks.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Sets the malformed line policy.
    pub fn with_malformed_policy(mut self, policy: MalformedPolicy) -> Self {
        self.malformed = policy;
        self
    }

    /// Sets the stall timeout.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    /// Sets the store settings.
    pub fn with_store_config(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Checks the configuration before any file is created or read.
    ///
    /// # Errors
    ///
    /// Returns `TraceStoreError::InvalidConfig` if there are no inputs, an
    /// input is not a regular file or is the store itself, a size is zero, the
    /// stall timeout is zero, or the store settings are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(invalid("at least one input file is required"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk size must be a positive integer"));
        }
        if self.queue_size == 0 {
            return Err(invalid("queue size must be a positive integer"));
        }
        if self.stall_timeout == Some(Duration::ZERO) {
            return Err(invalid("stall timeout must be positive"));
        }
        for input in &self.inputs {
            if !input.is_file() {
                return Err(invalid(format!(
                    "input {} is not a readable file",
                    input.display()
                )));
            }
            if same_file(input, &self.store_path) {
                return Err(invalid(format!(
                    "input {} is also the store path",
                    input.display()
                )));
            }
        }
        self.store.validate()
    }
}

fn invalid(message: impl Into<String>) -> TraceStoreError {
    TraceStoreError::InvalidConfig(message.into())
}

/// Returns true if `input` and `store` name the same file, however spelled.
/// `input` exists; `store` may not exist yet.
fn same_file(input: &Path, store: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let (Ok(input), Ok(store)) = (fs::metadata(input), fs::metadata(store)) {
            return input.dev() == store.dev() && input.ino() == store.ino();
        }
    }
    match (resolve(input), resolve(store)) {
        (Some(input), Some(store)) => input == store,
        _ => input == store,
    }
}

/// Absolute form of `path` with symlinks and `..` resolved. A file that does
/// not exist yet is resolved through its parent directory.
fn resolve(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = fs::canonicalize(path) {
        return Some(resolved);
    }
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::canonicalize(parent).ok().map(|parent| parent.join(name))
}
