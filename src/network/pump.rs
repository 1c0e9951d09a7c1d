//! Outbound pump
//!
//! Drains the encoder's chunk stream into the connection. A chunk that
//! cannot be sent right now is dropped and counted, never queued or
//! retried: for live video a gap is better than a stale frame.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CodecError, NetworkError};
use crate::network::connection::ConnectionManager;
use crate::protocol::{Chunk, ConnectionState};

/// Where the pump delivers chunks
pub trait ChunkSink: Send + Sync {
    fn state(&self) -> ConnectionState;

    fn send(&self, data: Bytes) -> Result<(), NetworkError>;
}

impl ChunkSink for ConnectionManager {
    fn state(&self) -> ConnectionState {
        ConnectionManager::state(self)
    }

    fn send(&self, data: Bytes) -> Result<(), NetworkError> {
        ConnectionManager::send(self, data)
    }
}

/// Pump counters, shared with whoever reports stats
#[derive(Debug, Default)]
pub struct PumpCounters {
    chunks_sent: AtomicU64,
    bytes_sent: AtomicU64,
    chunks_dropped: AtomicU64,
    encode_errors: AtomicU64,
}

impl PumpCounters {
    pub fn snapshot(&self) -> PumpStats {
        PumpStats {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Pump statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PumpStats {
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub chunks_dropped: u64,
    pub encode_errors: u64,
}

/// Why the pump stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The chunk stream ended, i.e. capture stopped
    StreamEnded,
    /// The encoder gave up
    EncoderFailed(CodecError),
}

pub struct OutboundPump {
    sink: Arc<dyn ChunkSink>,
    counters: Arc<PumpCounters>,
}

impl OutboundPump {
    pub fn new(sink: Arc<dyn ChunkSink>) -> Self {
        Self {
            sink,
            counters: Arc::new(PumpCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<PumpCounters> {
        self.counters.clone()
    }

    /// Hand one chunk to the connection, or drop it
    pub fn deliver(&self, chunk: Chunk) {
        if self.sink.state() != ConnectionState::Connected {
            self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Dropped chunk {} while {}", chunk.sequence, self.sink.state());
            return;
        }

        let len = chunk.len() as u64;
        match self.sink.send(chunk.data) {
            Ok(()) => {
                self.counters.chunks_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropped chunk {}: {}", chunk.sequence, e);
            }
        }
    }

    /// Run until the chunk stream ends or the encoder fails
    pub async fn run<S>(self, chunks: S) -> PumpExit
    where
        S: Stream<Item = Result<Chunk, CodecError>>,
    {
        tokio::pin!(chunks);
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => self.deliver(chunk),
                Err(e) if e.is_fatal() => {
                    tracing::error!("Outbound pump stopping: {}", e);
                    return PumpExit::EncoderFailed(e);
                }
                Err(e) => {
                    self.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Skipping chunk: {}", e);
                }
            }
        }
        tracing::info!("Chunk stream ended");
        PumpExit::StreamEnded
    }
}
