//! Tracestore - parallel packet-trace ingestion into a columnar store
//!
//! This crate turns newline-delimited JSON packet traces into a single
//! append-only store with three row-aligned datasets: fixed-width labels,
//! signed packet sizes and packet timestamps.
//!
//! # Components
//!
//! - [`TraceEncoder`]: Raw trace to column values
//! - [`ColumnarWriter`] / [`StoreReader`]: Store file format I/O
//! - [`ingest()`]: Reader threads, bounded chunk channel and store writer
//!
//! # Example
//!
//! ```rust,ignore
//! use tracestore::{ingest, IngestConfig, StoreReader};
//!
//! let config = IngestConfig::new("traces.trs", vec!["day1.jsonl".into(), "day2.jsonl.gz".into()]);
//! let report = ingest(&config)?;
//!
//! let store = StoreReader::open("traces.trs")?;
//! assert_eq!(store.len(), report.rows);
//! for row in store.read_rows()?.iter().take(3) {
//!     println!("{} {} packets", row.label.url, row.sizes.len());
//! }
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod ingest;
pub mod store;
pub mod trace;

pub use error::{EncodeError, Result, TraceStoreError};
pub use ingest::{ingest, IngestConfig, IngestReport, MalformedPolicy};
pub use store::{
    ColumnarWriter, Compression, Dataset, StoreConfig, StoreReader, StoreStatus, StoreSummary,
    StoredRow, SyncMode,
};
pub use trace::{EncodedRecord, RawTraceRecord, TraceEncoder, TraceLabel, TracePacket};
