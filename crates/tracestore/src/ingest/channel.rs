//! Bounded chunk hand-off between readers and the store writer.

use crate::error::{Result, TraceStoreError};
use crate::trace::EncodedRecord;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Index of a reader in the pipeline's input list.
pub type ReaderId = usize;

/// A batch of encoded records from one reader; the unit of transfer and of
/// store append.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Reader that produced the chunk.
    pub reader: ReaderId,
    /// Position of the chunk within its reader's output, from 0.
    pub sequence: u64,
    /// Records in input order.
    pub records: Vec<EncodedRecord>,
}

impl Chunk {
    /// Creates an empty chunk with room for `capacity` records.
    pub fn with_capacity(reader: ReaderId, sequence: u64, capacity: usize) -> Self {
        Self {
            reader,
            sequence,
            records: Vec::with_capacity(capacity),
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the chunk holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Per-reader totals reported on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderSummary {
    /// Reader index.
    pub reader: ReaderId,
    /// Input file.
    pub path: PathBuf,
    /// Records encoded and published.
    pub records: u64,
    /// Malformed lines skipped.
    pub skipped: u64,
    /// Chunks published.
    pub chunks: u64,
}

/// Message carried by the chunk channel.
#[derive(Debug)]
pub enum ChunkMessage {
    /// A non-empty chunk of records.
    Data(Chunk),
    /// The reader finished and will publish nothing more.
    Done(ReaderSummary),
    /// The reader stopped with a fatal error.
    Failed {
        /// Reader index.
        reader: ReaderId,
        /// Error that stopped it.
        error: TraceStoreError,
    },
    /// The reader's completion token was dropped without being redeemed.
    Vanished {
        /// Reader index.
        reader: ReaderId,
    },
}

/// Outcome of a non-blocking publish.
///
/// A refused chunk is handed back still wrapped in its
/// [`ChunkMessage::Data`] so it can be sent again without rebuilding it.
#[derive(Debug)]
pub enum TryPublish {
    /// The chunk was queued.
    Published,
    /// The channel is at capacity.
    Full(ChunkMessage),
    /// The writer is gone.
    Disconnected(ChunkMessage),
}

/// Outcome of waiting for the next message.
#[derive(Debug)]
pub enum Received {
    /// A message arrived.
    Message(ChunkMessage),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// Every sender is gone and the channel is drained.
    Disconnected,
}

/// Creates a chunk channel holding at most `capacity` messages.
///
/// A capacity of zero would make every publish a rendezvous, so it is raised to one.
pub fn chunk_channel(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let (sender, receiver) = channel::bounded(capacity.max(1));
    (ChunkSender { inner: sender }, ChunkReceiver { inner: receiver })
}

/// Producer half of the chunk channel.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    inner: Sender<ChunkMessage>,
}

impl ChunkSender {
    /// Publishes a chunk, blocking while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns `TraceStoreError::Cancelled` if the writer has hung up.
    pub fn publish(&self, chunk: Chunk) -> Result<()> {
        self.send(ChunkMessage::Data(chunk))
    }

    /// Publishes a chunk only if there is room right now.
    pub fn try_publish(&self, chunk: Chunk) -> TryPublish {
        match self.inner.try_send(ChunkMessage::Data(chunk)) {
            Ok(()) => TryPublish::Published,
            Err(TrySendError::Full(message)) => TryPublish::Full(message),
            Err(TrySendError::Disconnected(message)) => TryPublish::Disconnected(message),
        }
    }

    /// Sends a message, blocking while the channel is full.
    pub(super) fn send(&self, message: ChunkMessage) -> Result<()> {
        self.inner
            .send(message)
            .map_err(|_| TraceStoreError::Cancelled)
    }
}

/// Consumer half of the chunk channel. Owned by the store writer.
#[derive(Debug)]
pub struct ChunkReceiver {
    inner: Receiver<ChunkMessage>,
}

impl ChunkReceiver {
    /// Waits for the next message, for at most `timeout` if one is given.
    pub fn next(&self, timeout: Option<Duration>) -> Received {
        match timeout {
            None => match self.inner.recv() {
                Ok(message) => Received::Message(message),
                Err(_) => Received::Disconnected,
            },
            Some(timeout) => match self.inner.recv_timeout(timeout) {
                Ok(message) => Received::Message(message),
                Err(RecvTimeoutError::Timeout) => Received::TimedOut,
                Err(RecvTimeoutError::Disconnected) => Received::Disconnected,
            },
        }
    }

    /// Messages currently queued.
    pub fn queued(&self) -> usize {
        self.inner.len()
    }

    /// Channel capacity in messages.
    pub fn capacity(&self) -> usize {
        self.inner.capacity().unwrap_or(usize::MAX)
    }
}

/// Proof of a reader's termination.
///
/// Each reader owns exactly one token and publishes through it. Redeeming it
/// with [`CompletionToken::complete`] or [`CompletionToken::fail`] tells the
/// writer the reader is finished. A token dropped unredeemed (an early
/// return or a panic unwinding the reader thread) publishes
/// [`ChunkMessage::Vanished`], so the writer never waits on a dead reader.
#[derive(Debug)]
pub struct CompletionToken {
    sender: ChunkSender,
    reader: ReaderId,
    redeemed: bool,
}

impl CompletionToken {
    /// Creates the token for `reader`.
    pub fn new(sender: ChunkSender, reader: ReaderId) -> Self {
        Self {
            sender,
            reader,
            redeemed: false,
        }
    }

    /// The sender the reader publishes chunks through.
    pub fn sender(&self) -> &ChunkSender {
        &self.sender
    }

    /// Signals successful completion.
    ///
    /// # Errors
    ///
    /// Returns `TraceStoreError::Cancelled` if the writer has hung up.
    pub fn complete(mut self, summary: ReaderSummary) -> Result<()> {
        self.redeemed = true;
        self.sender.send(ChunkMessage::Done(summary))
    }

    /// Signals a fatal reader error. Delivery is best effort: a writer that
    /// has already hung up is no longer interested.
    pub fn fail(mut self, error: TraceStoreError) {
        self.redeemed = true;
        let _ = self.sender.send(ChunkMessage::Failed {
            reader: self.reader,
            error,
        });
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if !self.redeemed {
            let _ = self.sender.send(ChunkMessage::Vanished {
                reader: self.reader,
            });
        }
    }
}
