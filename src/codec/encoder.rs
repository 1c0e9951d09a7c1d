//! Chunk encoder
//!
//! Turns the capture ring into a lazy sequence of [`Chunk`]s, one per slice
//! interval, for as long as the capture stays active.

use async_stream::stream;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use image::codecs::jpeg::JpegEncoder;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

use crate::capture::{FrameTap, VideoFrame};
use crate::codec::negotiate::CodecRegistry;
use crate::config::EncoderConfig;
use crate::error::CodecError;
use crate::protocol::{Chunk, CodecKind};

/// Encodes the frames of one slice into a single payload
pub trait FrameEncoder: Send {
    fn codec(&self) -> CodecKind;

    fn encode_slice(&mut self, frames: &[Arc<VideoFrame>]) -> Result<Bytes, String>;
}

/// Concatenated baseline JPEGs
pub struct MjpegEncoder {
    quality: u8,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
}

impl MjpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            encode_buffer: Vec::with_capacity(64 * 1024),
        }
    }
}

impl FrameEncoder for MjpegEncoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Mjpeg
    }

    fn encode_slice(&mut self, frames: &[Arc<VideoFrame>]) -> Result<Bytes, String> {
        let mut out = BytesMut::new();
        for frame in frames {
            self.encode_buffer.clear();
            JpegEncoder::new_with_quality(&mut self.encode_buffer, self.quality)
                .encode_image(&frame.image)
                .map_err(|e| format!("frame {}: {}", frame.sequence, e))?;
            out.extend_from_slice(&self.encode_buffer);
        }
        Ok(out.freeze())
    }
}

/// Length-prefixed raw RGB: `[u32 BE width][u32 BE height][w*h*3 bytes]`
pub struct RawEncoder;

impl FrameEncoder for RawEncoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Raw
    }

    fn encode_slice(&mut self, frames: &[Arc<VideoFrame>]) -> Result<Bytes, String> {
        let total: usize = frames.iter().map(|f| 8 + f.image.as_raw().len()).sum();
        let mut out = BytesMut::with_capacity(total);
        for frame in frames {
            out.put_u32(frame.width());
            out.put_u32(frame.height());
            out.extend_from_slice(frame.image.as_raw());
        }
        Ok(out.freeze())
    }
}

/// Build a frame encoder for a negotiated codec
pub fn frame_encoder(codec: CodecKind, jpeg_quality: u8) -> Box<dyn FrameEncoder> {
    match codec {
        CodecKind::Mjpeg => Box::new(MjpegEncoder::new(jpeg_quality)),
        CodecKind::Raw => Box::new(RawEncoder),
    }
}

/// Shared encoder counters, readable while the stream runs
#[derive(Debug, Default)]
pub struct EncoderCounters {
    chunks_encoded: AtomicU64,
    frames_encoded: AtomicU64,
    bytes_produced: AtomicU64,
    encode_errors: AtomicU64,
}

impl EncoderCounters {
    pub fn snapshot(&self) -> EncoderStats {
        let chunks = self.chunks_encoded.load(Ordering::Relaxed);
        let bytes = self.bytes_produced.load(Ordering::Relaxed);
        EncoderStats {
            chunks_encoded: chunks,
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            bytes_produced: bytes,
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            average_chunk_size: if chunks > 0 { bytes as f32 / chunks as f32 } else { 0.0 },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EncoderStats {
    pub chunks_encoded: u64,
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub encode_errors: u64,
    pub average_chunk_size: f32,
}

/// Slices captured frames into chunks on a fixed cadence
pub struct ChunkEncoder {
    encoder: Box<dyn FrameEncoder>,
    slice_interval: Duration,
    max_consecutive_errors: u32,
    counters: Arc<EncoderCounters>,
}

impl ChunkEncoder {
    pub fn new(encoder: Box<dyn FrameEncoder>, slice_interval: Duration, max_consecutive_errors: u32) -> Self {
        Self {
            encoder,
            slice_interval,
            max_consecutive_errors: max_consecutive_errors.max(1),
            counters: Arc::new(EncoderCounters::default()),
        }
    }

    /// Negotiate a codec and build the encoder for it
    pub fn negotiate(registry: &CodecRegistry, config: &EncoderConfig) -> Result<Self, CodecError> {
        let codec = registry.negotiate(config.preferred_codec, config.fallback_codec)?;
        tracing::info!("Chunk encoder using {} every {} ms", codec, config.slice_interval_ms);
        Ok(Self::new(
            frame_encoder(codec, config.jpeg_quality),
            config.slice_interval(),
            config.max_consecutive_errors,
        ))
    }

    pub fn codec(&self) -> CodecKind {
        self.encoder.codec()
    }

    pub fn counters(&self) -> Arc<EncoderCounters> {
        self.counters.clone()
    }

    /// Start slicing. The stream yields per-chunk `EncodeError`s without
    /// ending; it ends when capture stops, or after yielding
    /// `EncoderFailure` once the consecutive error limit is hit.
    pub fn start(self, tap: FrameTap) -> impl Stream<Item = Result<Chunk, CodecError>> + Send + 'static {
        let ChunkEncoder {
            mut encoder,
            slice_interval,
            max_consecutive_errors,
            counters,
        } = self;
        let codec = encoder.codec();

        stream! {
            let start = tokio::time::Instant::now() + slice_interval;
            let mut ticker = tokio::time::interval_at(start, slice_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut sequence: u64 = 0;
            let mut consecutive_errors: u32 = 0;

            loop {
                ticker.tick().await;
                let active = tap.is_active();
                let frames = tap.drain();

                if frames.is_empty() {
                    if !active {
                        break;
                    }
                    tracing::trace!("Empty slice, nothing captured");
                    continue;
                }

                match encoder.encode_slice(&frames) {
                    Ok(data) => {
                        consecutive_errors = 0;
                        counters.chunks_encoded.fetch_add(1, Ordering::Relaxed);
                        counters.frames_encoded.fetch_add(frames.len() as u64, Ordering::Relaxed);
                        counters.bytes_produced.fetch_add(data.len() as u64, Ordering::Relaxed);

                        tracing::trace!("Chunk {}: {} frames, {} bytes", sequence, frames.len(), data.len());
                        yield Ok(Chunk {
                            sequence,
                            codec,
                            frame_count: frames.len(),
                            data,
                            created_at: Instant::now(),
                        });
                    }
                    Err(reason) => {
                        consecutive_errors += 1;
                        counters.encode_errors.fetch_add(1, Ordering::Relaxed);

                        if consecutive_errors >= max_consecutive_errors {
                            tracing::error!("Encoder giving up after {} consecutive errors", consecutive_errors);
                            yield Err(CodecError::EncoderFailure { consecutive: consecutive_errors });
                            break;
                        }
                        tracing::warn!("Chunk {} failed to encode: {}", sequence, reason);
                        yield Err(CodecError::EncodeError { sequence, reason });
                    }
                }
                sequence += 1;

                if !active {
                    break;
                }
            }
        }
    }
}
