//! Pipeline orchestration: spawn readers, drain the channel into the store.

use super::channel::{
    chunk_channel, ChunkMessage, ChunkReceiver, ChunkSender, CompletionToken, Received,
    ReaderSummary,
};
use super::producer::TraceProducer;
use super::IngestConfig;
use crate::error::{Result, TraceStoreError};
use crate::store::{ColumnarWriter, StoreSummary};
use crate::trace::EncodedRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of a successful ingestion run.
#[derive(Debug, Clone)]
pub struct IngestReport {
    /// Rows written to every dataset.
    pub rows: u64,
    /// Chunks appended to the store.
    pub chunks: u64,
    /// Per-reader totals, ordered by reader index.
    pub readers: Vec<ReaderSummary>,
    /// The closed store.
    pub store: StoreSummary,
    /// Wall time from store creation to close.
    pub elapsed: Duration,
}

impl IngestReport {
    /// Malformed lines skipped across all readers.
    pub fn skipped(&self) -> u64 {
        self.readers.iter().map(|reader| reader.skipped).sum()
    }
}

/// Ingests every input of `config` into a new store.
///
/// The store is created before any reader starts, so a store that cannot be
/// opened fails the run without reading input. One thread per input encodes
/// records and publishes chunks; the calling thread appends them to the store
/// in arrival order. The run succeeds only after every reader has signalled
/// completion and its thread has been joined.
///
/// On the first fatal error (a failed, vanished or panicked reader, a stall,
/// or a store write error) the remaining readers are cancelled and joined,
/// the store is aborted at its last committed chunk, and the error is
/// returned.
///
/// # Errors
///
/// Returns `TraceStoreError::InvalidConfig` for a rejected configuration, or
/// the first fatal error of the run.
pub fn ingest(config: &IngestConfig) -> Result<IngestReport> {
    config.validate()?;

    let started = Instant::now();
    let mut writer = ColumnarWriter::create(&config.store_path, config.store.clone())?;
    info!(
        store = %config.store_path.display(),
        inputs = config.inputs.len(),
        chunk_size = config.chunk_size,
        queue_size = config.queue_size,
        "starting ingestion"
    );

    let outcome = run_readers(config, &mut writer, |producer, sender| producer.run(sender));
    finish(writer, outcome, started)
}

/// Destination of drained chunks.
trait ChunkSink {
    /// Appends one chunk, returning the row count after the append.
    fn append_chunk(&mut self, records: &[EncodedRecord]) -> Result<u64>;
}

impl ChunkSink for ColumnarWriter {
    fn append_chunk(&mut self, records: &[EncodedRecord]) -> Result<u64> {
        ColumnarWriter::append_chunk(self, records)
    }
}

/// Runs one reader thread per input through `read` and drains their chunks
/// into `sink`. Returns only after every reader thread has been joined.
fn run_readers<S, R>(config: &IngestConfig, sink: &mut S, read: R) -> Result<Vec<ReaderSummary>>
where
    S: ChunkSink,
    R: Fn(&TraceProducer<'_>, &ChunkSender) -> Result<ReaderSummary> + Sync,
{
    let cancel = AtomicBool::new(false);
    let (sender, receiver) = chunk_channel(config.queue_size);
    let read = &read;

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(config.inputs.len());
        let mut spawn_error = None;

        for (reader, path) in config.inputs.iter().enumerate() {
            let producer =
                TraceProducer::new(reader, path, config.chunk_size, config.malformed, &cancel);
            let sender = sender.clone();
            let spawned = thread::Builder::new()
                .name(format!("reader-{}", reader))
                .spawn_scoped(scope, move || {
                    let token = CompletionToken::new(sender, reader);
                    match read(&producer, token.sender()) {
                        Ok(summary) => {
                            if token.complete(summary).is_err() {
                                debug!(reader, "writer gone before completion was delivered");
                            }
                        }
                        Err(e) => token.fail(e),
                    }
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    spawn_error = Some(TraceStoreError::IoError(e));
                    break;
                }
            }
        }
        drop(sender);

        let drained = match spawn_error {
            Some(e) => Err(e),
            None => drain(sink, &receiver, config),
        };
        if drained.is_err() {
            cancel.store(true, Ordering::Relaxed);
        }
        // Unblocks any reader still waiting to publish.
        drop(receiver);

        let mut panicked = None;
        for (reader, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() && panicked.is_none() {
                panicked = Some(TraceStoreError::ReaderPanicked {
                    path: config.inputs[reader].clone(),
                });
            }
        }

        match (drained, panicked) {
            (Ok(readers), None) => Ok(readers),
            (_, Some(panic)) => Err(panic),
            (Err(e), None) => Err(e),
        }
    })
}

/// Closes the store after a successful run or aborts it after a failed one.
fn finish(
    writer: ColumnarWriter,
    outcome: Result<Vec<ReaderSummary>>,
    started: Instant,
) -> Result<IngestReport> {
    match outcome {
        Ok(mut readers) => {
            readers.sort_by_key(|summary| summary.reader);
            let store = writer.close()?;
            let report = IngestReport {
                rows: store.rows,
                chunks: store.chunks,
                readers,
                store,
                elapsed: started.elapsed(),
            };
            info!(
                rows = report.rows,
                chunks = report.chunks,
                skipped = report.skipped(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "ingestion complete"
            );
            Ok(report)
        }
        Err(e) => {
            warn!(error = %e, "ingestion failed, aborting store");
            if let Err(abort_error) = writer.abort() {
                warn!(error = %abort_error, "failed to abort store");
            }
            Err(e)
        }
    }
}

/// Appends chunks until every reader has completed.
fn drain<S: ChunkSink>(
    sink: &mut S,
    receiver: &ChunkReceiver,
    config: &IngestConfig,
) -> Result<Vec<ReaderSummary>> {
    let mut pending = vec![true; config.inputs.len()];
    let mut remaining = pending.len();
    let mut summaries = Vec::with_capacity(remaining);
    debug!(capacity = receiver.capacity(), "draining chunk channel");

    while remaining > 0 {
        match receiver.next(config.stall_timeout) {
            Received::Message(ChunkMessage::Data(chunk)) => {
                let rows = sink.append_chunk(&chunk.records)?;
                debug!(
                    reader = chunk.reader,
                    sequence = chunk.sequence,
                    records = chunk.len(),
                    rows,
                    queued = receiver.queued(),
                    "chunk appended"
                );
            }
            Received::Message(ChunkMessage::Done(summary)) => {
                if pending[summary.reader] {
                    pending[summary.reader] = false;
                    remaining -= 1;
                    info!(
                        path = %summary.path.display(),
                        records = summary.records,
                        skipped = summary.skipped,
                        "reader completed"
                    );
                    summaries.push(summary);
                }
            }
            Received::Message(ChunkMessage::Failed { reader, error }) => {
                return Err(TraceStoreError::ReaderFailed {
                    path: config.inputs[reader].clone(),
                    source: Box::new(error),
                });
            }
            Received::Message(ChunkMessage::Vanished { reader }) => {
                return Err(TraceStoreError::ReaderVanished {
                    path: config.inputs[reader].clone(),
                });
            }
            Received::TimedOut => {
                return Err(TraceStoreError::Stalled {
                    timeout: config.stall_timeout.unwrap_or_default(),
                    pending: remaining,
                });
            }
            Received::Disconnected => {
                let reader = pending.iter().position(|&p| p).unwrap_or_default();
                return Err(TraceStoreError::ReaderVanished {
                    path: config.inputs[reader].clone(),
                });
            }
        }
    }

    Ok(summaries)
}
