//! Error and Result types for trace ingestion and store operations.

use crate::store::Dataset;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` type for tracestore operations.
pub type Result<T> = std::result::Result<T, TraceStoreError>;

/// Reasons a decoded trace record cannot be encoded into column values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    /// The record carries no packets.
    #[error("Trace is empty")]
    EmptyTrace,

    /// A packet size is not a whole number.
    #[error("Packet {index}: size magnitude {value} is not an integer")]
    NonIntegralSize {
        /// Position of the packet within the trace.
        index: usize,
        /// Offending size value.
        value: f64,
    },

    /// A packet direction is neither `1` nor `-1`.
    #[error("Packet {index}: direction sign must be 1 or -1, got {value}")]
    InvalidDirection {
        /// Position of the packet within the trace.
        index: usize,
        /// Offending direction value.
        value: f64,
    },

    /// The signed packet size does not fit a 32-bit integer.
    #[error("Packet {index}: signed size {value} does not fit in i32")]
    SizeOutOfRange {
        /// Position of the packet within the trace.
        index: usize,
        /// Signed size that overflowed.
        value: f64,
    },

    /// A packet timestamp is NaN or infinite.
    #[error("Packet {index}: timestamp is not finite")]
    NonFiniteTimestamp {
        /// Position of the packet within the trace.
        index: usize,
    },
}

/// The error type for ingestion and store operations.
#[derive(Debug, Error)]
pub enum TraceStoreError {
    /// Invalid magic bytes in the store header or footer.
    #[error("Invalid magic bytes: expected TRCS, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported store format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Unknown compression identifier in the store header.
    #[error("Unknown compression id: {0}")]
    UnknownCompression(u8),

    /// Frame payload checksum does not match the recorded value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Structurally invalid frame or footer.
    #[error("Corrupt store: {0}")]
    Corrupt(String),

    /// Error during compression.
    #[error("Compression error: {0}")]
    CompressionError(String),

    /// Error during decompression.
    #[error("Decompression error: {0}")]
    DecompressionError(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// An input line is not a valid trace record.
    #[error("{}:{line}: Malformed trace record: {source}", path.display())]
    Parse {
        /// Input file containing the line.
        path: PathBuf,
        /// 1-based line number.
        line: u64,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// An input record decoded but could not be encoded.
    #[error("{}:{line}: {reason}", path.display())]
    Encode {
        /// Input file containing the line.
        path: PathBuf,
        /// 1-based line number.
        line: u64,
        /// What was wrong with the trace.
        reason: EncodeError,
    },

    /// Configuration rejected at startup.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A reader reported a fatal error.
    #[error("Reader for {} failed: {source}", path.display())]
    ReaderFailed {
        /// Input file handled by the reader.
        path: PathBuf,
        /// Error reported by the reader.
        #[source]
        source: Box<TraceStoreError>,
    },

    /// A reader exited without signalling completion.
    #[error("Reader for {} exited without completing", path.display())]
    ReaderVanished {
        /// Input file handled by the reader.
        path: PathBuf,
    },

    /// A reader thread panicked.
    #[error("Reader for {} panicked", path.display())]
    ReaderPanicked {
        /// Input file handled by the reader.
        path: PathBuf,
    },

    /// No reader made progress within the configured stall timeout.
    #[error("No chunk received for {timeout:?} with {pending} reader(s) pending")]
    Stalled {
        /// Configured stall timeout.
        timeout: Duration,
        /// Readers that had not completed.
        pending: usize,
    },

    /// Work stopped because the pipeline was cancelled.
    #[error("Ingestion cancelled")]
    Cancelled,

    /// Co-indexed datasets disagree on their row count.
    #[error("Dataset {dataset} has {actual} rows, expected {expected}")]
    RowCountMismatch {
        /// Dataset with the wrong length.
        dataset: Dataset,
        /// Expected row count.
        expected: u64,
        /// Actual row count.
        actual: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_capitalized() {
        let errors = [
            TraceStoreError::Cancelled,
            TraceStoreError::ReaderVanished {
                path: PathBuf::from("a.jsonl"),
            },
            TraceStoreError::ReaderPanicked {
                path: PathBuf::from("a.jsonl"),
            },
            TraceStoreError::ReaderFailed {
                path: PathBuf::from("a.jsonl"),
                source: Box::new(TraceStoreError::Cancelled),
            },
            TraceStoreError::Stalled {
                timeout: Duration::from_secs(1),
                pending: 2,
            },
            TraceStoreError::RowCountMismatch {
                dataset: Dataset::Sizes,
                expected: 3,
                actual: 2,
            },
        ];
        for error in &errors {
            let message = error.to_string();
            assert!(
                message.starts_with(|c: char| c.is_ascii_uppercase()),
                "{}",
                message
            );
        }

        assert_eq!(EncodeError::EmptyTrace.to_string(), "Trace is empty");
        assert_eq!(
            TraceStoreError::ReaderPanicked {
                path: PathBuf::from("a.jsonl")
            }
            .to_string(),
            "Reader for a.jsonl panicked"
        );
        let encode = TraceStoreError::Encode {
            path: PathBuf::from("a.jsonl"),
            line: 4,
            reason: EncodeError::NonFiniteTimestamp { index: 1 },
        };
        assert_eq!(encode.to_string(), "a.jsonl:4: Packet 1: timestamp is not finite");
    }
}
