use crate::error::{Result, TraceStoreError};
use crate::store::format::{
    decode_descriptor, decode_labels, decode_varlen, Element, FrameHeader, FrameKind,
    StoreFooter, StoreHeader, FOOTER_SIZE, FRAME_HEADER_SIZE, HEADER_SIZE,
};
use crate::store::{Dataset, StoreStatus};
use crate::trace::TraceLabel;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One fully decoded store row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    /// Label fields (after fixed-width truncation).
    #[serde(flatten)]
    pub label: TraceLabel,
    /// Signed packet sizes.
    pub sizes: Vec<i32>,
    /// Packet timestamps.
    pub timestamps: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
struct FrameRef {
    header: FrameHeader,
    payload_offset: u64,
}

/// Read access to a store written by [`crate::store::ColumnarWriter`].
///
/// Opening scans frame headers only; dataset blocks are read, checksummed and
/// decompressed when a `read_*` method is called. A store without a footer
/// (writer crashed) is exposed up to its last whole chunk.
#[derive(Debug)]
pub struct StoreReader {
    path: PathBuf,
    header: StoreHeader,
    footer: Option<StoreFooter>,
    frames: [Vec<FrameRef>; 3],
    rows: u64,
}

impl StoreReader {
    /// Opens a store and indexes its frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid, frames are out of order or
    /// reference unknown datasets, or a closed store's datasets disagree with
    /// its footer.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header = StoreHeader::read_from(&mut reader)?;
        let footer = Self::read_footer(&mut reader, file_len)?;
        let frames_end = footer.as_ref().map_or(file_len, |f| f.frames_end);

        let mut frames: [Vec<FrameRef>; 3] = Default::default();
        let mut lengths = [0u64; 3];
        let mut created = [false; 3];
        let mut position = HEADER_SIZE as u64;
        reader.seek(SeekFrom::Start(position))?;

        while position + FRAME_HEADER_SIZE as u64 <= frames_end {
            let frame = match FrameHeader::read_from(&mut reader) {
                Ok(frame) => frame,
                Err(e) if footer.is_none() => {
                    debug!(offset = position, error = %e, "ignoring unreadable trailing frame");
                    break;
                }
                Err(e) => return Err(e),
            };
            let payload_offset = position + FRAME_HEADER_SIZE as u64;
            let next = position + frame.frame_len();
            if next > frames_end {
                if footer.is_some() {
                    return Err(TraceStoreError::Corrupt(format!(
                        "frame at offset {} runs past the end of the frame section",
                        position
                    )));
                }
                debug!(offset = position, "ignoring torn trailing frame");
                break;
            }

            let index = frame.dataset.index();
            match frame.kind {
                FrameKind::Create => {
                    if created[index] {
                        return Err(TraceStoreError::Corrupt(format!(
                            "dataset {} created twice",
                            frame.dataset
                        )));
                    }
                    let mut payload = vec![0u8; frame.payload_len as usize];
                    reader.read_exact(&mut payload)?;
                    Self::check_crc(&frame, &payload)?;
                    let (kind, width) = decode_descriptor(&payload)?;
                    let expected_width = match frame.dataset {
                        Dataset::Labels => header.label_layout.record_width() as u32,
                        Dataset::Sizes => i32::WIDTH as u32,
                        Dataset::Timestamps => f64::WIDTH as u32,
                    };
                    if kind != frame.dataset.element_kind() || width != expected_width {
                        return Err(TraceStoreError::Corrupt(format!(
                            "dataset {} declared as {:?} of width {}",
                            frame.dataset, kind, width
                        )));
                    }
                    created[index] = true;
                }
                FrameKind::Extend => {
                    if !created[index] {
                        return Err(TraceStoreError::Corrupt(format!(
                            "dataset {} extended before creation",
                            frame.dataset
                        )));
                    }
                    if frame.start_row != lengths[index] {
                        return Err(TraceStoreError::Corrupt(format!(
                            "dataset {} extended at row {}, expected {}",
                            frame.dataset, frame.start_row, lengths[index]
                        )));
                    }
                    lengths[index] += u64::from(frame.row_count);
                    frames[index].push(FrameRef {
                        header: frame,
                        payload_offset,
                    });
                    reader.seek(SeekFrom::Start(next))?;
                }
            }
            position = next;
        }

        let rows = match &footer {
            Some(footer) => {
                for dataset in Dataset::ALL {
                    let actual = lengths[dataset.index()];
                    if actual != footer.row_count {
                        return Err(TraceStoreError::RowCountMismatch {
                            dataset,
                            expected: footer.row_count,
                            actual,
                        });
                    }
                }
                footer.row_count
            }
            None => {
                let whole = lengths.iter().copied().min().unwrap_or(0);
                for list in &mut frames {
                    list.retain(|f| f.header.start_row + u64::from(f.header.row_count) <= whole);
                }
                if lengths.iter().any(|&l| l != whole) {
                    warn!(
                        path = %path.display(),
                        rows = whole,
                        "store has no footer, exposing whole chunks only"
                    );
                }
                whole
            }
        };

        Ok(Self {
            path,
            header,
            footer,
            frames,
            rows,
        })
    }

    fn read_footer<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<Option<StoreFooter>> {
        let min_len = (HEADER_SIZE + FOOTER_SIZE) as u64;
        if file_len < min_len {
            return Ok(None);
        }
        let footer_offset = file_len - FOOTER_SIZE as u64;
        reader.seek(SeekFrom::Start(footer_offset))?;
        match StoreFooter::read_from(reader) {
            Ok(footer) if footer.frames_end == footer_offset => Ok(Some(footer)),
            Err(TraceStoreError::IoError(e)) => Err(e.into()),
            Ok(_) | Err(_) => Ok(None),
        }
    }

    fn check_crc(frame: &FrameHeader, payload: &[u8]) -> Result<()> {
        let actual = crc32fast::hash(payload);
        if actual != frame.payload_crc32 {
            return Err(TraceStoreError::ChecksumMismatch {
                expected: frame.payload_crc32,
                actual,
            });
        }
        Ok(())
    }

    /// Reads, verifies and decompresses every block of `dataset`.
    fn read_blocks(&self, dataset: Dataset) -> Result<Vec<(FrameHeader, Vec<u8>)>> {
        let mut file = BufReader::new(File::open(&self.path)?);
        let mut blocks = Vec::with_capacity(self.frames[dataset.index()].len());
        for frame in &self.frames[dataset.index()] {
            file.seek(SeekFrom::Start(frame.payload_offset))?;
            let mut payload = vec![0u8; frame.header.payload_len as usize];
            file.read_exact(&mut payload)?;
            Self::check_crc(&frame.header, &payload)?;
            let raw = self
                .header
                .compression
                .decompress(&payload, frame.header.raw_len as usize)?;
            blocks.push((frame.header, raw));
        }
        Ok(blocks)
    }

    /// Reads the `labels` dataset.
    pub fn read_labels(&self) -> Result<Vec<TraceLabel>> {
        let layout = self.header.label_layout;
        let mut out = Vec::with_capacity(self.rows as usize);
        for (frame, raw) in self.read_blocks(Dataset::Labels)? {
            out.extend(decode_labels(&raw, frame.row_count as usize, &layout)?);
        }
        Ok(out)
    }

    /// Reads the `sizes` dataset.
    pub fn read_sizes(&self) -> Result<Vec<Vec<i32>>> {
        self.read_varlen(Dataset::Sizes)
    }

    /// Reads the `timestamps` dataset.
    pub fn read_timestamps(&self) -> Result<Vec<Vec<f64>>> {
        self.read_varlen(Dataset::Timestamps)
    }

    fn read_varlen<T: Element>(&self, dataset: Dataset) -> Result<Vec<Vec<T>>> {
        let mut out = Vec::with_capacity(self.rows as usize);
        for (frame, raw) in self.read_blocks(dataset)? {
            out.extend(decode_varlen::<T>(&raw, frame.row_count as usize)?);
        }
        Ok(out)
    }

    /// Reads all three datasets and zips them into rows.
    pub fn read_rows(&self) -> Result<Vec<StoredRow>> {
        let labels = self.read_labels()?;
        let sizes = self.read_sizes()?;
        let timestamps = self.read_timestamps()?;
        Ok(labels
            .into_iter()
            .zip(sizes)
            .zip(timestamps)
            .map(|((label, sizes), timestamps)| StoredRow {
                label,
                sizes,
                timestamps,
            })
            .collect())
    }

    /// Checks every block checksum and the row alignment of all datasets.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch`, a decode error, or `RowCountMismatch` if a
    /// dataset's decoded length differs from the store length or a row's
    /// size and timestamp sequences differ in length.
    pub fn verify(&self) -> Result<()> {
        let labels = self.read_labels()?.len() as u64;
        let sizes = self.read_sizes()?;
        let timestamps = self.read_timestamps()?;

        for (dataset, actual) in [
            (Dataset::Labels, labels),
            (Dataset::Sizes, sizes.len() as u64),
            (Dataset::Timestamps, timestamps.len() as u64),
        ] {
            if actual != self.rows {
                return Err(TraceStoreError::RowCountMismatch {
                    dataset,
                    expected: self.rows,
                    actual,
                });
            }
        }

        for (row, (s, t)) in sizes.iter().zip(&timestamps).enumerate() {
            if s.len() != t.len() {
                return Err(TraceStoreError::Corrupt(format!(
                    "row {} has {} sizes but {} timestamps",
                    row,
                    s.len(),
                    t.len()
                )));
            }
        }
        Ok(())
    }

    /// Rows exposed by the store.
    pub fn len(&self) -> u64 {
        self.rows
    }

    /// Returns true if the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Rows in one dataset.
    pub fn dataset_len(&self, dataset: Dataset) -> u64 {
        self.frames[dataset.index()]
            .iter()
            .map(|f| u64::from(f.header.row_count))
            .sum()
    }

    /// Chunks exposed by the store.
    pub fn chunk_count(&self) -> u64 {
        self.frames[Dataset::Labels.index()].len() as u64
    }

    /// How the store was closed.
    pub fn status(&self) -> StoreStatus {
        self.footer
            .as_ref()
            .map_or(StoreStatus::Incomplete, |f| f.status)
    }

    /// The store header.
    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    /// The store footer, if the writer closed the store.
    pub fn footer(&self) -> Option<&StoreFooter> {
        self.footer.as_ref()
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
