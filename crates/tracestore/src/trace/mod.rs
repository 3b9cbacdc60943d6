//! Packet-trace record types and the column encoder.
//!
//! Each line of input is one [`RawTraceRecord`]: a JSON object carrying the
//! fetched `url`, the transport `protocol`, the capture `region` and the
//! packet `trace` as `[timestamp, size_magnitude, direction_sign]` triples.
//!
//! ```text
//! {"url":"example.com","protocol":"tcp","region":"eu","trace":[[0.0,1500,1],[0.01,60,-1]]}
//! ```
//!
//! The [`TraceEncoder`] turns a raw record into an [`EncodedRecord`], the three
//! column values stored per row: label fields, signed sizes and timestamps.

mod encoder;

pub use encoder::TraceEncoder;

use serde::{Deserialize, Serialize};

/// One packet of a raw trace: `(timestamp, size_magnitude, direction_sign)`.
///
/// Deserialized from a three-element JSON array. All components are read as
/// JSON numbers; integrality and sign are checked by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TracePacket(pub f64, pub f64, pub f64);

impl TracePacket {
    /// Packet timestamp in seconds.
    pub fn timestamp(&self) -> f64 {
        self.0
    }

    /// Unsigned packet size in bytes.
    pub fn size_magnitude(&self) -> f64 {
        self.1
    }

    /// `1` for outgoing, `-1` for incoming.
    pub fn direction_sign(&self) -> f64 {
        self.2
    }
}

/// A single trace as it appears on one input line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTraceRecord {
    /// URL the trace was captured for.
    pub url: String,
    /// Transport protocol label.
    pub protocol: String,
    /// Capture region label.
    pub region: String,
    /// Ordered packets of the trace.
    pub trace: Vec<TracePacket>,
}

impl RawTraceRecord {
    /// Parses a record from one line of JSON. Invalid UTF-8 is a parse error.
    pub fn from_json(line: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(line)
    }
}

/// Column values for one store row.
///
/// `sizes[i]` is the packet size multiplied by its direction sign, and
/// `timestamps[i]` the matching raw timestamp. Both vectors are owned by the
/// record and never share storage with the encoder's scratch space.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRecord {
    /// URL label.
    pub url: String,
    /// Protocol label.
    pub protocol: String,
    /// Region label.
    pub region: String,
    /// Packet timestamps in input order.
    pub timestamps: Vec<f64>,
    /// Signed packet sizes in input order.
    pub sizes: Vec<i32>,
}

impl EncodedRecord {
    /// Number of packets in the row.
    pub fn packet_count(&self) -> usize {
        self.sizes.len()
    }
}

/// Label fields of a stored row, decoded from the fixed-width record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLabel {
    /// URL label.
    pub url: String,
    /// Protocol label.
    pub protocol: String,
    /// Region label.
    pub region: String,
}

impl TraceLabel {
    /// Creates a label from its three fields.
    pub fn new(
        url: impl Into<String>,
        protocol: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            protocol: protocol.into(),
            region: region.into(),
        }
    }
}
