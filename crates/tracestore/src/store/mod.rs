//! Append-only columnar store for encoded traces.
//!
//! A store holds three co-indexed datasets that grow together, one chunk at
//! a time:
//!
//! | dataset      | element                                   |
//! |--------------|-------------------------------------------|
//! | `labels`     | fixed-width record `{url, protocol, region}` |
//! | `sizes`      | variable-length sequence of `i32`          |
//! | `timestamps` | variable-length sequence of `f64`          |
//!
//! The [`ColumnarWriter`] is the only component that mutates a store. The
//! [`StoreReader`] reopens a finished (or crashed) store for analysis and
//! verification. See [`format`] for the byte layout.

pub mod format;
mod reader;
mod writer;

pub use reader::{StoreReader, StoredRow};
pub use writer::{ColumnarWriter, StoreSummary};

use crate::error::{Result, TraceStoreError};
use std::fmt;
use std::io::{Read, Write};

/// Default gzip level for dataset blocks.
pub const DEFAULT_GZIP_LEVEL: u32 = 4;

/// Default byte width of the `url` label field.
pub const DEFAULT_URL_WIDTH: u16 = 100;

/// Default byte width of the `protocol` label field.
pub const DEFAULT_PROTOCOL_WIDTH: u16 = 10;

/// Default byte width of the `region` label field.
pub const DEFAULT_REGION_WIDTH: u16 = 7;

/// One of the three co-indexed datasets of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Dataset {
    /// Fixed-width label records.
    Labels = 0,
    /// Signed packet sizes per row.
    Sizes = 1,
    /// Packet timestamps per row.
    Timestamps = 2,
}

impl Dataset {
    /// All datasets, in the order each chunk extends them.
    pub const ALL: [Dataset; 3] = [Dataset::Labels, Dataset::Sizes, Dataset::Timestamps];

    /// Creates a Dataset from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Labels),
            1 => Some(Self::Sizes),
            2 => Some(Self::Timestamps),
            _ => None,
        }
    }

    /// Dataset name as exposed to analysis tooling.
    pub fn name(self) -> &'static str {
        match self {
            Self::Labels => "labels",
            Self::Sizes => "sizes",
            Self::Timestamps => "timestamps",
        }
    }

    /// On-disk element kind of the dataset.
    pub fn element_kind(self) -> ElementKind {
        match self {
            Self::Labels => ElementKind::FixedRecord,
            Self::Sizes => ElementKind::VarInt32,
            Self::Timestamps => ElementKind::VarFloat64,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element encoding of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementKind {
    /// One fixed-width byte record per row.
    FixedRecord = 1,
    /// A variable-length sequence of `i32` per row.
    VarInt32 = 2,
    /// A variable-length sequence of `f64` per row.
    VarFloat64 = 3,
}

impl ElementKind {
    /// Creates an ElementKind from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::FixedRecord),
            2 => Some(Self::VarInt32),
            3 => Some(Self::VarFloat64),
            _ => None,
        }
    }
}

/// Block compression applied uniformly to every dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Blocks are stored raw.
    None,
    /// Blocks are gzip members at the given level (0-9).
    Gzip(u32),
}

impl Default for Compression {
    fn default() -> Self {
        Self::Gzip(DEFAULT_GZIP_LEVEL)
    }
}

impl Compression {
    /// Identifier stored in the header.
    pub fn id(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip(_) => 1,
        }
    }

    /// Level stored in the header (0 when uncompressed).
    pub fn level(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip(level) => level.min(9) as u8,
        }
    }

    /// Rebuilds the compression setting from header fields.
    pub fn from_parts(id: u8, level: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip(u32::from(level))),
            other => Err(TraceStoreError::UnknownCompression(other)),
        }
    }

    /// Compresses a raw dataset block.
    pub fn compress(self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(raw.to_vec()),
            Self::Gzip(level) => {
                let mut encoder = flate2::write::GzEncoder::new(
                    Vec::with_capacity(raw.len() / 2),
                    flate2::Compression::new(level),
                );
                encoder
                    .write_all(raw)
                    .map_err(|e| TraceStoreError::CompressionError(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| TraceStoreError::CompressionError(e.to_string()))
            }
        }
    }

    /// Restores a raw block of `raw_len` bytes from its stored payload.
    pub fn decompress(self, payload: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let raw = match self {
            Self::None => payload.to_vec(),
            Self::Gzip(_) => {
                // raw_len comes from disk; bound the up-front allocation.
                let mut raw = Vec::with_capacity(raw_len.min(payload.len().saturating_mul(16)));
                flate2::read::GzDecoder::new(payload)
                    .read_to_end(&mut raw)
                    .map_err(|e| TraceStoreError::DecompressionError(e.to_string()))?;
                raw
            }
        };
        if raw.len() != raw_len {
            return Err(TraceStoreError::DecompressionError(format!(
                "block length mismatch: expected {}, got {}",
                raw_len,
                raw.len()
            )));
        }
        Ok(raw)
    }
}

/// Sync mode applied after each committed chunk.
///
/// Closing a store always fsyncs regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each chunk (highest durability).
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// Flush to the OS only (default, fastest).
    #[default]
    None,
}

/// Byte widths of the fixed label record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelLayout {
    /// Width of the `url` field.
    pub url: u16,
    /// Width of the `protocol` field.
    pub protocol: u16,
    /// Width of the `region` field.
    pub region: u16,
}

impl Default for LabelLayout {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL_WIDTH,
            protocol: DEFAULT_PROTOCOL_WIDTH,
            region: DEFAULT_REGION_WIDTH,
        }
    }
}

impl LabelLayout {
    /// Total width of one label record in bytes.
    pub fn record_width(&self) -> usize {
        usize::from(self.url) + usize::from(self.protocol) + usize::from(self.region)
    }

    /// Appends one fixed-width label record to `out`.
    ///
    /// Non-ASCII characters become `?`; fields are truncated to their width
    /// and NUL-padded.
    pub fn encode_into(&self, url: &str, protocol: &str, region: &str, out: &mut Vec<u8>) {
        encode_field(url, usize::from(self.url), out);
        encode_field(protocol, usize::from(self.protocol), out);
        encode_field(region, usize::from(self.region), out);
    }

    /// Decodes a record previously written by [`LabelLayout::encode_into`].
    pub fn decode(&self, record: &[u8]) -> crate::trace::TraceLabel {
        let url_end = usize::from(self.url);
        let protocol_end = url_end + usize::from(self.protocol);
        crate::trace::TraceLabel {
            url: decode_field(&record[..url_end]),
            protocol: decode_field(&record[url_end..protocol_end]),
            region: decode_field(&record[protocol_end..self.record_width()]),
        }
    }

    /// Truncates and sanitizes `value` the way it will be stored.
    pub fn stored_form(value: &str, width: u16) -> String {
        let mut buf = Vec::with_capacity(usize::from(width));
        encode_field(value, usize::from(width), &mut buf);
        decode_field(&buf)
    }
}

fn encode_field(value: &str, width: usize, out: &mut Vec<u8>) {
    let start = out.len();
    out.extend(
        value
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .take(width),
    );
    out.resize(start + width, 0);
}

fn decode_field(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Store-level settings fixed at creation time.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Block compression for all datasets.
    pub compression: Compression,
    /// Durability applied per committed chunk.
    pub sync_mode: SyncMode,
    /// Label field widths.
    pub label_layout: LabelLayout,
}

impl StoreConfig {
    /// Sets the block compression.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the per-chunk sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the label field widths.
    pub fn with_label_layout(mut self, label_layout: LabelLayout) -> Self {
        self.label_layout = label_layout;
        self
    }

    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// Returns `TraceStoreError::InvalidConfig` for a gzip level above 9 or a
    /// zero-width label field.
    pub fn validate(&self) -> Result<()> {
        if let Compression::Gzip(level) = self.compression {
            if level > 9 {
                return Err(TraceStoreError::InvalidConfig(format!(
                    "gzip level must be 0-9, got {}",
                    level
                )));
            }
        }
        let layout = self.label_layout;
        if layout.url == 0 || layout.protocol == 0 || layout.region == 0 {
            return Err(TraceStoreError::InvalidConfig(
                "label field widths must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state recorded in (or inferred from) a store's footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreStatus {
    /// Closed after every reader finished.
    Complete = 1,
    /// Closed by a failed pipeline; holds every chunk committed before the failure.
    Aborted = 2,
    /// No footer: the writer never closed the store.
    Incomplete = 0,
}

impl StoreStatus {
    /// Creates a StoreStatus from a footer byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Complete),
            2 => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::Incomplete => "incomplete",
        })
    }
}
