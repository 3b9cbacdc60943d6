//! Store file format.
//!
//! A store is a single little-endian file that only ever grows at its tail
//! while the writer is open:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Store Header (32 bytes)                                     │
//! │  - Magic: "TRCS" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Compression id / level: u8 + u8                           │
//! │  - Label widths url/protocol/region: 3 × u16                 │
//! │  - Created at: i64 ns since epoch (8 bytes)                  │
//! │  - Reserved: 10 bytes                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Frames (repeated)                                           │
//! │  - Create frame: first time a dataset receives rows          │
//! │  - Extend frames: labels, sizes, timestamps per chunk        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (32 bytes, only once closed or aborted)              │
//! │  - Frames end, row count, chunk count, status, "SCRT"        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Frame header (36 bytes):
//!
//! ```text
//! Offset Size Field
//! 0x00   1    kind (1 = create, 2 = extend)
//! 0x01   1    dataset (0 labels, 1 sizes, 2 timestamps)
//! 0x02   2    reserved
//! 0x04   8    start_row (u64 LE)
//! 0x0C   4    row_count (u32 LE)
//! 0x10   8    raw_len (u64 LE)
//! 0x18   8    payload_len (u64 LE)
//! 0x20   4    payload_crc32 (u32 LE)
//! ```
//!
//! Raw extend blocks: `labels` is `rows × record_width` bytes. `sizes` and
//! `timestamps` are `rows × u32` element counts followed by every element of
//! every row (`i32` or `f64`).

use crate::error::{Result, TraceStoreError};
use crate::store::{Compression, Dataset, ElementKind, LabelLayout, StoreStatus};
use crate::trace::{EncodedRecord, TraceLabel};
use std::io::{Read, Write};

/// Magic bytes for the store header: "TRCS"
pub const STORE_MAGIC: [u8; 4] = *b"TRCS";

/// Reverse magic bytes for the store footer: "SCRT"
pub const STORE_MAGIC_REVERSE: [u8; 4] = *b"SCRT";

/// Current store format version.
pub const STORE_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 36;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 32;

/// Create frame payload size in bytes.
pub const DESCRIPTOR_SIZE: usize = 5;

/// Store header (32 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    /// Magic bytes: "TRCS"
    pub magic: [u8; 4],
    /// File format version.
    pub version: u16,
    /// Block compression of all datasets.
    pub compression: Compression,
    /// Label field widths.
    pub label_layout: LabelLayout,
    /// Creation time in nanoseconds since the Unix epoch.
    pub created_at: i64,
}

impl StoreHeader {
    /// Creates a header stamped with the current time.
    pub fn new(compression: Compression, label_layout: LabelLayout) -> Self {
        Self {
            magic: STORE_MAGIC,
            version: STORE_VERSION,
            compression,
            label_layout,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0),
        }
    }

    /// Writes the header to a writer using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&[self.compression.id(), self.compression.level()])?;
        writer.write_all(&self.label_layout.url.to_le_bytes())?;
        writer.write_all(&self.label_layout.protocol.to_le_bytes())?;
        writer.write_all(&self.label_layout.region.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        writer.write_all(&[0u8; 10])?;
        Ok(())
    }

    /// Reads a header from a reader using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns `TraceStoreError::InvalidMagic` if the magic bytes don't match,
    /// `TraceStoreError::UnsupportedVersion` for a newer format, and
    /// `TraceStoreError::UnknownCompression` for an unknown compression id.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != STORE_MAGIC {
            return Err(TraceStoreError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version > STORE_VERSION {
            return Err(TraceStoreError::UnsupportedVersion(version));
        }

        let compression = Compression::from_parts(buf[6], buf[7])?;
        let label_layout = LabelLayout {
            url: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
            protocol: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
            region: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
        };
        let created_at = i64::from_le_bytes(buf[14..22].try_into().unwrap());

        Ok(Self {
            magic,
            version,
            compression,
            label_layout,
            created_at,
        })
    }
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Declares a dataset and its element layout.
    Create = 1,
    /// Appends rows at the dataset's tail.
    Extend = 2,
}

impl FrameKind {
    /// Creates a FrameKind from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Create),
            2 => Some(Self::Extend),
            _ => None,
        }
    }
}

/// Frame header (36 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type.
    pub kind: FrameKind,
    /// Target dataset.
    pub dataset: Dataset,
    /// First row written by this frame (dataset length before it).
    pub start_row: u64,
    /// Rows written by this frame.
    pub row_count: u32,
    /// Uncompressed payload length.
    pub raw_len: u64,
    /// Stored payload length.
    pub payload_len: u64,
    /// CRC32 of the stored payload.
    pub payload_crc32: u32,
}

impl FrameHeader {
    /// Writes the frame header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.kind as u8, self.dataset as u8, 0, 0])?;
        writer.write_all(&self.start_row.to_le_bytes())?;
        writer.write_all(&self.row_count.to_le_bytes())?;
        writer.write_all(&self.raw_len.to_le_bytes())?;
        writer.write_all(&self.payload_len.to_le_bytes())?;
        writer.write_all(&self.payload_crc32.to_le_bytes())?;
        Ok(())
    }

    /// Reads a frame header.
    ///
    /// # Errors
    ///
    /// Returns `TraceStoreError::Corrupt` for an unknown kind or dataset.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let kind = FrameKind::from_u8(buf[0])
            .ok_or_else(|| TraceStoreError::Corrupt(format!("unknown frame kind {}", buf[0])))?;
        let dataset = Dataset::from_u8(buf[1])
            .ok_or_else(|| TraceStoreError::Corrupt(format!("unknown dataset id {}", buf[1])))?;

        Ok(Self {
            kind,
            dataset,
            start_row: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            row_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            raw_len: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            payload_len: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            payload_crc32: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        })
    }

    /// Total bytes occupied by this frame on disk.
    pub fn frame_len(&self) -> u64 {
        FRAME_HEADER_SIZE as u64 + self.payload_len
    }
}

/// Store footer (32 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFooter {
    /// Offset just past the last committed frame.
    pub frames_end: u64,
    /// Rows in every dataset.
    pub row_count: u64,
    /// Chunks appended.
    pub chunk_count: u64,
    /// How the store was closed.
    pub status: StoreStatus,
    /// Reverse magic bytes: "SCRT"
    pub magic_reverse: [u8; 4],
}

impl StoreFooter {
    /// Creates a footer.
    pub fn new(frames_end: u64, row_count: u64, chunk_count: u64, status: StoreStatus) -> Self {
        Self {
            frames_end,
            row_count,
            chunk_count,
            status,
            magic_reverse: STORE_MAGIC_REVERSE,
        }
    }

    /// Writes the footer using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.frames_end.to_le_bytes())?;
        writer.write_all(&self.row_count.to_le_bytes())?;
        writer.write_all(&self.chunk_count.to_le_bytes())?;
        writer.write_all(&[self.status as u8, 0, 0, 0])?;
        writer.write_all(&self.magic_reverse)?;
        Ok(())
    }

    /// Reads a footer.
    ///
    /// # Errors
    ///
    /// Returns `TraceStoreError::InvalidMagic` if the reverse magic bytes don't
    /// match and `TraceStoreError::Corrupt` for an unknown status.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic_reverse: [u8; 4] = buf[28..32].try_into().unwrap();
        if magic_reverse != STORE_MAGIC_REVERSE {
            return Err(TraceStoreError::InvalidMagic(magic_reverse));
        }
        let status = StoreStatus::from_u8(buf[24])
            .ok_or_else(|| TraceStoreError::Corrupt(format!("unknown store status {}", buf[24])))?;

        Ok(Self {
            frames_end: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            row_count: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            chunk_count: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            status,
            magic_reverse,
        })
    }
}

/// Payload of a create frame.
pub fn encode_descriptor(dataset: Dataset, layout: &LabelLayout) -> Vec<u8> {
    let width = match dataset.element_kind() {
        ElementKind::FixedRecord => layout.record_width() as u32,
        ElementKind::VarInt32 => i32::WIDTH as u32,
        ElementKind::VarFloat64 => f64::WIDTH as u32,
    };
    let mut out = Vec::with_capacity(DESCRIPTOR_SIZE);
    out.push(dataset.element_kind() as u8);
    out.extend_from_slice(&width.to_le_bytes());
    out
}

/// Parses a create frame payload into `(kind, element width)`.
pub fn decode_descriptor(payload: &[u8]) -> Result<(ElementKind, u32)> {
    if payload.len() != DESCRIPTOR_SIZE {
        return Err(TraceStoreError::Corrupt(format!(
            "dataset descriptor is {} bytes, expected {}",
            payload.len(),
            DESCRIPTOR_SIZE
        )));
    }
    let kind = ElementKind::from_u8(payload[0])
        .ok_or_else(|| TraceStoreError::Corrupt(format!("unknown element kind {}", payload[0])))?;
    let width = u32::from_le_bytes(payload[1..5].try_into().unwrap());
    Ok((kind, width))
}

/// Element type of a variable-length dataset.
pub trait Element: Copy {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Appends the little-endian encoding.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decodes from exactly [`Self::WIDTH`] bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

impl Element for i32 {
    const WIDTH: usize = 4;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        i32::from_le_bytes(bytes.try_into().unwrap())
    }
}

impl Element for f64 {
    const WIDTH: usize = 8;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        f64::from_le_bytes(bytes.try_into().unwrap())
    }
}

/// Raw `labels` block for a batch of records.
pub fn encode_labels(records: &[EncodedRecord], layout: &LabelLayout) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * layout.record_width());
    for record in records {
        layout.encode_into(&record.url, &record.protocol, &record.region, &mut out);
    }
    out
}

/// Decodes a raw `labels` block of `rows` records.
pub fn decode_labels(raw: &[u8], rows: usize, layout: &LabelLayout) -> Result<Vec<TraceLabel>> {
    let width = layout.record_width();
    if raw.len() != rows * width {
        return Err(TraceStoreError::Corrupt(format!(
            "labels block is {} bytes, expected {} rows of {}",
            raw.len(),
            rows,
            width
        )));
    }
    Ok(raw.chunks_exact(width).map(|r| layout.decode(r)).collect())
}

/// Raw variable-length block: per-row counts, then all elements.
pub fn encode_varlen<'a, T, I>(rows: I) -> Result<Vec<u8>>
where
    T: Element + 'a,
    I: ExactSizeIterator<Item = &'a [T]> + Clone,
{
    let total: usize = rows.clone().map(<[T]>::len).sum();
    let mut out = Vec::with_capacity(rows.len() * 4 + total * T::WIDTH);
    for row in rows.clone() {
        let len = u32::try_from(row.len()).map_err(|_| {
            TraceStoreError::Corrupt(format!("row of {} elements exceeds u32", row.len()))
        })?;
        out.extend_from_slice(&len.to_le_bytes());
    }
    for row in rows {
        for &value in row {
            value.write_le(&mut out);
        }
    }
    Ok(out)
}

/// Decodes a raw variable-length block of `rows` rows.
pub fn decode_varlen<T: Element>(raw: &[u8], rows: usize) -> Result<Vec<Vec<T>>> {
    let counts_len = rows * 4;
    if raw.len() < counts_len {
        return Err(TraceStoreError::Corrupt(format!(
            "variable-length block of {} bytes cannot hold {} row lengths",
            raw.len(),
            rows
        )));
    }
    let (counts, mut values) = raw.split_at(counts_len);
    let counts: Vec<usize> = counts
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()) as usize)
        .collect();

    let expected: usize = counts.iter().sum::<usize>() * T::WIDTH;
    if values.len() != expected {
        return Err(TraceStoreError::Corrupt(format!(
            "variable-length block holds {} value bytes, expected {}",
            values.len(),
            expected
        )));
    }

    let mut out = Vec::with_capacity(rows);
    for count in counts {
        let (row, rest) = values.split_at(count * T::WIDTH);
        out.push(row.chunks_exact(T::WIDTH).map(T::read_le).collect());
        values = rest;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = StoreHeader::new(Compression::Gzip(4), LabelLayout::default());
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[0..4], b"TRCS");
        assert_eq!(StoreHeader::read_from(&mut buf.as_slice()).unwrap(), header);
    }

    #[test]
    fn test_header_bad_magic() {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(b"ATSM");
        assert!(matches!(
            StoreHeader::read_from(&mut buf.as_slice()),
            Err(TraceStoreError::InvalidMagic(m)) if &m == b"ATSM"
        ));
    }

    #[test]
    fn test_header_future_version() {
        let header = StoreHeader::new(Compression::None, LabelLayout::default());
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        buf[4..6].copy_from_slice(&(STORE_VERSION + 1).to_le_bytes());
        assert!(matches!(
            StoreHeader::read_from(&mut buf.as_slice()),
            Err(TraceStoreError::UnsupportedVersion(v)) if v == STORE_VERSION + 1
        ));
    }

    #[test]
    fn test_frame_header_size() {
        let frame = FrameHeader {
            kind: FrameKind::Extend,
            dataset: Dataset::Timestamps,
            start_row: 10,
            row_count: 3,
            raw_len: 100,
            payload_len: 40,
            payload_crc32: 0xDEADBEEF,
        };
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();

        assert_eq!(buf.len(), FRAME_HEADER_SIZE);
        assert_eq!(FrameHeader::read_from(&mut buf.as_slice()).unwrap(), frame);
        assert_eq!(frame.frame_len(), 76);
    }

    #[test]
    fn test_frame_header_unknown_dataset() {
        let mut buf = vec![0u8; FRAME_HEADER_SIZE];
        buf[0] = FrameKind::Extend as u8;
        buf[1] = 9;
        assert!(matches!(
            FrameHeader::read_from(&mut buf.as_slice()),
            Err(TraceStoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_footer_layout() {
        let footer = StoreFooter::new(4096, 12, 3, StoreStatus::Aborted);
        let mut buf = Vec::new();
        footer.write_to(&mut buf).unwrap();

        assert_eq!(buf.len(), FOOTER_SIZE);
        assert_eq!(&buf[28..32], b"SCRT");
        assert_eq!(StoreFooter::read_from(&mut buf.as_slice()).unwrap(), footer);
    }

    #[test]
    fn test_descriptor() {
        let layout = LabelLayout::default();
        let (kind, width) = decode_descriptor(&encode_descriptor(Dataset::Labels, &layout)).unwrap();
        assert_eq!(kind, ElementKind::FixedRecord);
        assert_eq!(width, 117);

        let (kind, width) =
            decode_descriptor(&encode_descriptor(Dataset::Timestamps, &layout)).unwrap();
        assert_eq!(kind, ElementKind::VarFloat64);
        assert_eq!(width, 8);
    }

    #[test]
    fn test_varlen_block_with_empty_row() {
        let rows: Vec<Vec<i32>> = vec![vec![1, -2, 3], vec![], vec![i32::MIN]];
        let raw = encode_varlen(rows.iter().map(Vec::as_slice)).unwrap();

        assert_eq!(raw.len(), 3 * 4 + 4 * 4);
        assert_eq!(decode_varlen::<i32>(&raw, 3).unwrap(), rows);
    }

    #[test]
    fn test_varlen_block_truncated() {
        let rows: Vec<Vec<f64>> = vec![vec![0.5, 1.5]];
        let raw = encode_varlen(rows.iter().map(Vec::as_slice)).unwrap();
        assert!(decode_varlen::<f64>(&raw[..raw.len() - 1], 1).is_err());
        assert!(decode_varlen::<f64>(&raw[..2], 1).is_err());
    }

    #[test]
    fn test_labels_block() {
        let layout = LabelLayout::default();
        let records = vec![EncodedRecord {
            url: "a.org".to_string(),
            protocol: "tcp".to_string(),
            region: "ap-south-1".to_string(),
            timestamps: vec![0.0],
            sizes: vec![1],
        }];
        let raw = encode_labels(&records, &layout);
        let labels = decode_labels(&raw, 1, &layout).unwrap();

        assert_eq!(labels[0], TraceLabel::new("a.org", "tcp", "ap-sout"));
        assert!(decode_labels(&raw, 2, &layout).is_err());
    }
}
