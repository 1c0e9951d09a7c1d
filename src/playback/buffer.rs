//! Playback timeline
//!
//! Received media chunks are appended, in receive order, to a
//! [`TimelineSink`]. A sink accepts an append only while it is open and
//! not busy with the previous one; anything else is dropped and counted.
//! The buffer never queues: a late chunk is worth less than the next one.

use bytes::Bytes;
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::codec::ChunkDecoder;
use crate::error::PlaybackError;

/// Readiness of a timeline sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkState {
    /// Rendering surface not ready yet
    Pending,
    Open,
    Ended,
}

/// Receives media chunks for playback
pub trait TimelineSink: Send {
    fn state(&self) -> SinkState;

    /// True while the previous append is still being processed
    fn is_updating(&self) -> bool;

    /// Only called while open and not updating
    fn append(&mut self, chunk: Bytes);

    /// Mark the end of the stream. Called at most once, while open.
    fn end_of_stream(&mut self);
}

/// Latest frame decoded from the remote stream
pub type RemoteFrameReceiver = watch::Receiver<Option<Arc<RgbImage>>>;

/// Display target for remote playback, shared across sessions
#[derive(Clone)]
pub struct RemoteSurface {
    tx: Arc<watch::Sender<Option<Arc<RgbImage>>>>,
}

impl RemoteSurface {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> RemoteFrameReceiver {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<RgbImage>> {
        self.tx.borrow().clone()
    }

    fn show(&self, frame: RgbImage) {
        self.tx.send_replace(Some(Arc::new(frame)));
    }

    fn clear(&self) {
        self.tx.send_replace(None);
    }
}

impl Default for RemoteSurface {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes each appended chunk off the event loop and shows its newest
/// frame on a [`RemoteSurface`]
pub struct DecodingSink {
    state: SinkState,
    updating: Arc<AtomicBool>,
    decoder: Arc<Mutex<ChunkDecoder>>,
    surface: RemoteSurface,
    /// Set once the stream has ended; held while showing a frame
    ended: Arc<Mutex<bool>>,
}

impl DecodingSink {
    pub fn new(surface: RemoteSurface) -> Self {
        Self {
            state: SinkState::Open,
            updating: Arc::new(AtomicBool::new(false)),
            decoder: Arc::new(Mutex::new(ChunkDecoder::new())),
            surface,
            ended: Arc::new(Mutex::new(false)),
        }
    }
}

impl TimelineSink for DecodingSink {
    fn state(&self) -> SinkState {
        self.state
    }

    fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    fn append(&mut self, chunk: Bytes) {
        self.updating.store(true, Ordering::Release);
        let updating = self.updating.clone();
        let decoder = self.decoder.clone();
        let surface = self.surface.clone();
        let ended = self.ended.clone();

        tokio::task::spawn_blocking(move || {
            match decoder.lock().decode_latest(&chunk) {
                Ok(Some(frame)) => {
                    // A decode finishing after end of stream must not resurrect the surface
                    let ended = ended.lock();
                    if !*ended {
                        surface.show(frame);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Dropping undecodable media chunk: {}", e),
            }
            updating.store(false, Ordering::Release);
        });
    }

    fn end_of_stream(&mut self) {
        self.state = SinkState::Ended;
        let mut ended = self.ended.lock();
        *ended = true;
        self.surface.clear();
    }
}

/// Playback counters, shared with whoever reports stats
#[derive(Debug, Default)]
pub struct PlaybackCounters {
    appended: AtomicU64,
    bytes_appended: AtomicU64,
    dropped_not_open: AtomicU64,
    dropped_busy: AtomicU64,
}

impl PlaybackCounters {
    pub fn snapshot(&self) -> PlaybackStats {
        PlaybackStats {
            chunks_appended: self.appended.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            dropped_not_open: self.dropped_not_open.load(Ordering::Relaxed),
            dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PlaybackStats {
    pub chunks_appended: u64,
    pub bytes_appended: u64,
    pub dropped_not_open: u64,
    pub dropped_busy: u64,
}

/// Playback buffer with at most one attached sink
#[derive(Default)]
pub struct PlaybackBuffer {
    sink: Option<Box<dyn TimelineSink>>,
    counters: Arc<PlaybackCounters>,
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> Arc<PlaybackCounters> {
        self.counters.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Attach a fresh sink; the previous one is finalized first
    pub fn attach(&mut self, sink: Box<dyn TimelineSink>) {
        self.finalize();
        self.sink = Some(sink);
    }

    /// Append one chunk, or reject it without side effects
    pub fn append(&mut self, chunk: Bytes) -> Result<(), PlaybackError> {
        let Some(sink) = self.sink.as_mut() else {
            self.counters.dropped_not_open.fetch_add(1, Ordering::Relaxed);
            return Err(PlaybackError::BufferAppendRejected { reason: "no sink attached" });
        };

        match sink.state() {
            SinkState::Open => {}
            SinkState::Pending => {
                self.counters.dropped_not_open.fetch_add(1, Ordering::Relaxed);
                return Err(PlaybackError::BufferAppendRejected { reason: "sink not open yet" });
            }
            SinkState::Ended => {
                self.counters.dropped_not_open.fetch_add(1, Ordering::Relaxed);
                return Err(PlaybackError::BufferAppendRejected { reason: "sink ended" });
            }
        }
        if sink.is_updating() {
            self.counters.dropped_busy.fetch_add(1, Ordering::Relaxed);
            return Err(PlaybackError::BufferAppendRejected { reason: "previous append in progress" });
        }

        let len = chunk.len() as u64;
        sink.append(chunk);
        self.counters.appended.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_appended.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// End the stream if the sink is open, then discard it. Idempotent.
    pub fn finalize(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if sink.state() == SinkState::Open {
                sink.end_of_stream();
            }
        }
    }
}

impl Drop for PlaybackBuffer {
    fn drop(&mut self) {
        self.finalize();
    }
}
