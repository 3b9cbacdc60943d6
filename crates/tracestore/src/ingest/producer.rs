//! Per-file reader: stream, parse, encode, batch, publish.

use super::channel::{Chunk, ChunkSender, ReaderId, ReaderSummary, TryPublish};
use super::MalformedPolicy;
use crate::error::{Result, TraceStoreError};
use crate::trace::{RawTraceRecord, TraceEncoder};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Read buffer for input files.
const INPUT_BUFFER_SIZE: usize = 256 * 1024;

/// Upper bound on records preallocated per chunk.
const MAX_PREALLOCATED_RECORDS: usize = 8192;

/// Reads one input file and publishes its records as chunks.
///
/// Records keep their input order, both within a chunk and across the
/// reader's chunks. Blank lines are ignored. Lines are read as bytes, so a
/// line that is not valid UTF-8 is malformed like any other and handled by
/// the [`MalformedPolicy`]. The reader checks the shared
/// cancellation flag before every line and stops with
/// `TraceStoreError::Cancelled` once it is set.
pub struct TraceProducer<'a> {
    reader: ReaderId,
    path: PathBuf,
    chunk_size: usize,
    policy: MalformedPolicy,
    cancel: &'a AtomicBool,
}

impl<'a> TraceProducer<'a> {
    /// Creates a reader for `path`.
    pub fn new(
        reader: ReaderId,
        path: impl Into<PathBuf>,
        chunk_size: usize,
        policy: MalformedPolicy,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            reader,
            path: path.into(),
            chunk_size: chunk_size.max(1),
            policy,
            cancel,
        }
    }

    /// Streams the whole file through `sender`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, a parse or encode
    /// error for a malformed line under [`MalformedPolicy::Abort`], or
    /// `TraceStoreError::Cancelled` if the pipeline was cancelled.
    pub fn run(&self, sender: &ChunkSender) -> Result<ReaderSummary> {
        let mut input = open_input(&self.path)?;
        let mut encoder = TraceEncoder::new();
        let mut line = Vec::new();
        let mut line_number = 0u64;

        let mut summary = ReaderSummary {
            reader: self.reader,
            path: self.path.clone(),
            records: 0,
            skipped: 0,
            chunks: 0,
        };
        let mut chunk = self.empty_chunk(0);

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                debug!(path = %self.path.display(), "reader cancelled");
                return Err(TraceStoreError::Cancelled);
            }

            line.clear();
            if input.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            line_number += 1;

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let record = match RawTraceRecord::from_json(&line) {
                Ok(record) => record,
                Err(source) => {
                    self.reject(
                        TraceStoreError::Parse {
                            path: self.path.clone(),
                            line: line_number,
                            source,
                        },
                        &mut summary,
                    )?;
                    continue;
                }
            };

            let encoded = match encoder.encode(record) {
                Ok(encoded) => encoded,
                Err(reason) => {
                    self.reject(
                        TraceStoreError::Encode {
                            path: self.path.clone(),
                            line: line_number,
                            reason,
                        },
                        &mut summary,
                    )?;
                    continue;
                }
            };

            chunk.records.push(encoded);
            if chunk.len() >= self.chunk_size {
                let next = self.empty_chunk(chunk.sequence + 1);
                self.publish(sender, mem::replace(&mut chunk, next), &mut summary)?;
            }
        }

        if !chunk.is_empty() {
            self.publish(sender, chunk, &mut summary)?;
        }

        debug!(
            path = %self.path.display(),
            records = summary.records,
            encoded = encoder.encoded_count(),
            skipped = summary.skipped,
            chunks = summary.chunks,
            "reader finished"
        );
        Ok(summary)
    }

    fn empty_chunk(&self, sequence: u64) -> Chunk {
        Chunk::with_capacity(
            self.reader,
            sequence,
            self.chunk_size.min(MAX_PREALLOCATED_RECORDS),
        )
    }

    fn publish(
        &self,
        sender: &ChunkSender,
        chunk: Chunk,
        summary: &mut ReaderSummary,
    ) -> Result<()> {
        let records = chunk.len() as u64;
        match sender.try_publish(chunk) {
            TryPublish::Published => {}
            TryPublish::Full(message) => {
                debug!(reader = self.reader, "chunk queue full, waiting for writer");
                sender.send(message)?;
            }
            TryPublish::Disconnected(_) => return Err(TraceStoreError::Cancelled),
        }
        summary.records += records;
        summary.chunks += 1;
        Ok(())
    }

    fn reject(&self, error: TraceStoreError, summary: &mut ReaderSummary) -> Result<()> {
        match self.policy {
            MalformedPolicy::Abort => Err(error),
            MalformedPolicy::Skip => {
                warn!(error = %error, "skipping malformed trace");
                summary.skipped += 1;
                Ok(())
            }
        }
    }
}

/// Opens an input file, decompressing it if the name ends in `.gz`.
fn open_input(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    let gzipped = path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("gz"));

    if gzipped {
        Ok(Box::new(BufReader::with_capacity(
            INPUT_BUFFER_SIZE,
            MultiGzDecoder::new(file),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(INPUT_BUFFER_SIZE, file)))
    }
}
