use crate::error::{Result, TraceStoreError};
use crate::store::format::{
    encode_descriptor, encode_labels, encode_varlen, FrameHeader, FrameKind, StoreFooter,
    StoreHeader, HEADER_SIZE,
};
use crate::store::{Dataset, StoreConfig, StoreStatus, SyncMode};
use crate::trace::EncodedRecord;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of closing or aborting a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    /// Path of the store file.
    pub path: PathBuf,
    /// Rows in each dataset.
    pub rows: u64,
    /// Chunks appended.
    pub chunks: u64,
    /// Final status written to the footer.
    pub status: StoreStatus,
    /// Final file size in bytes.
    pub bytes: u64,
}

/// Sequential appender for a columnar store.
///
/// Writes the header on creation, then for every chunk:
/// 1. A create frame per dataset the first time rows arrive
/// 2. Extend frames for `labels`, `sizes`, `timestamps`, in that order
/// 3. A commit (flush, then sync per [`SyncMode`])
///
/// The three datasets therefore hold the same number of rows at every chunk
/// boundary. Existing bytes are never rewritten; [`ColumnarWriter::abort`]
/// only cuts off a chunk that was not committed.
pub struct ColumnarWriter {
    /// Buffered writer for the file.
    file: BufWriter<File>,
    /// Path to the file being written.
    path: PathBuf,
    /// Store settings.
    config: StoreConfig,
    /// Current write position.
    position: u64,
    /// Write position after the last committed chunk.
    committed: u64,
    /// Rows per dataset.
    lengths: [u64; 3],
    /// Whether each dataset has its create frame.
    created: [bool; 3],
    /// Committed rows.
    rows: u64,
    /// Committed chunks.
    chunks: u64,
}

impl ColumnarWriter {
    /// Creates an empty store at `path`, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the file cannot be
    /// created.
    pub fn create(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut file = BufWriter::new(file);

        let header = StoreHeader::new(config.compression, config.label_layout);
        header.write_to(&mut file)?;
        file.flush()?;

        debug!(path = %path.display(), compression = ?config.compression, "created store");

        Ok(Self {
            file,
            path,
            config,
            position: HEADER_SIZE as u64,
            committed: HEADER_SIZE as u64,
            lengths: [0; 3],
            created: [false; 3],
            rows: 0,
            chunks: 0,
        })
    }

    /// Appends one chunk of records to all three datasets.
    ///
    /// Returns the store's row count after the append. An empty slice is not
    /// a chunk and leaves the store untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if compression or any write fails. The chunk is then
    /// uncommitted and the writer should be aborted.
    pub fn append_chunk(&mut self, records: &[EncodedRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(self.rows);
        }
        let row_count = u32::try_from(records.len()).map_err(|_| {
            TraceStoreError::InvalidConfig(format!(
                "chunk of {} records exceeds the per-frame row limit",
                records.len()
            ))
        })?;

        for dataset in Dataset::ALL {
            if !self.created[dataset.index()] {
                self.write_create(dataset)?;
            }
        }

        let labels = encode_labels(records, &self.config.label_layout);
        self.write_extend(Dataset::Labels, row_count, &labels)?;

        let sizes = encode_varlen(records.iter().map(|r| r.sizes.as_slice()))?;
        self.write_extend(Dataset::Sizes, row_count, &sizes)?;

        let timestamps = encode_varlen(records.iter().map(|r| r.timestamps.as_slice()))?;
        self.write_extend(Dataset::Timestamps, row_count, &timestamps)?;

        self.commit()?;
        self.rows += u64::from(row_count);
        self.chunks += 1;

        debug!(
            rows = row_count,
            total_rows = self.rows,
            chunk = self.chunks,
            "appended chunk"
        );

        Ok(self.rows)
    }

    fn write_create(&mut self, dataset: Dataset) -> Result<()> {
        let payload = encode_descriptor(dataset, &self.config.label_layout);
        let frame = FrameHeader {
            kind: FrameKind::Create,
            dataset,
            start_row: 0,
            row_count: 0,
            raw_len: payload.len() as u64,
            payload_len: payload.len() as u64,
            payload_crc32: crc32fast::hash(&payload),
        };
        self.write_frame(&frame, &payload)?;
        self.created[dataset.index()] = true;
        debug!(dataset = %dataset, "created dataset");
        Ok(())
    }

    fn write_extend(&mut self, dataset: Dataset, row_count: u32, raw: &[u8]) -> Result<()> {
        let payload = self.config.compression.compress(raw)?;
        let frame = FrameHeader {
            kind: FrameKind::Extend,
            dataset,
            start_row: self.lengths[dataset.index()],
            row_count,
            raw_len: raw.len() as u64,
            payload_len: payload.len() as u64,
            payload_crc32: crc32fast::hash(&payload),
        };
        self.write_frame(&frame, &payload)?;
        self.lengths[dataset.index()] += u64::from(row_count);
        Ok(())
    }

    fn write_frame(&mut self, frame: &FrameHeader, payload: &[u8]) -> Result<()> {
        frame.write_to(&mut self.file)?;
        self.file.write_all(payload)?;
        self.position += frame.frame_len();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.file.flush()?;
        match self.config.sync_mode {
            SyncMode::Fsync => self.file.get_ref().sync_all()?,
            SyncMode::Fdatasync => self.file.get_ref().sync_data()?,
            SyncMode::None => {}
        }
        self.committed = self.position;
        Ok(())
    }

    /// Writes a complete footer, fsyncs and closes the store.
    ///
    /// # Errors
    ///
    /// Returns an error if any I/O operation fails.
    pub fn close(self) -> Result<StoreSummary> {
        let rows = self.rows;
        let chunks = self.chunks;
        let summary = self.finish(StoreStatus::Complete)?;
        info!(
            path = %summary.path.display(),
            rows,
            chunks,
            bytes = summary.bytes,
            "closed store"
        );
        Ok(summary)
    }

    /// Marks the store aborted.
    ///
    /// Any partially written chunk is cut off so the file holds exactly the
    /// chunks committed before the failure, followed by an aborted footer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be truncated or the footer written.
    pub fn abort(self) -> Result<StoreSummary> {
        let summary = self.finish(StoreStatus::Aborted)?;
        warn!(
            path = %summary.path.display(),
            rows = summary.rows,
            "aborted store"
        );
        Ok(summary)
    }

    fn finish(self, status: StoreStatus) -> Result<StoreSummary> {
        let mut file = match self.file.into_inner() {
            Ok(file) => file,
            Err(err) => {
                let (error, writer) = err.into_parts();
                if status == StoreStatus::Complete {
                    return Err(error.into());
                }
                warn!("Discarding unflushed store bytes: {:?}", error);
                writer.into_parts().0
            }
        };

        if status == StoreStatus::Aborted && self.position != self.committed {
            debug!(
                from = self.position,
                to = self.committed,
                "truncating uncommitted chunk"
            );
        }
        file.set_len(self.committed)?;
        file.seek(SeekFrom::Start(self.committed))?;

        let footer = StoreFooter::new(self.committed, self.rows, self.chunks, status);
        footer.write_to(&mut file)?;
        file.sync_all()?;

        Ok(StoreSummary {
            path: self.path,
            rows: self.rows,
            chunks: self.chunks,
            status,
            bytes: self.committed + crate::store::format::FOOTER_SIZE as u64,
        })
    }

    /// Rows committed so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Chunks committed so far.
    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    /// Rows in one dataset, including an uncommitted chunk in progress.
    pub fn dataset_len(&self, dataset: Dataset) -> u64 {
        self.lengths[dataset.index()]
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
