//! Captured frames and the lock-free ring that carries them to the encoder
//!
//! The capture thread is the single producer; the chunk encoder drains the
//! ring once per slice. When the encoder falls behind, the oldest frames
//! are evicted so a slice always carries the freshest video.

use crossbeam::queue::ArrayQueue;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// One captured RGB frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: RgbImage,
    /// Capture sequence number
    pub sequence: u64,
    /// Microseconds since capture started
    pub timestamp_us: u64,
}

impl VideoFrame {
    pub fn new(image: RgbImage, sequence: u64, timestamp_us: u64) -> Self {
        Self {
            image,
            sequence,
            timestamp_us,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Bounded SPSC frame queue that evicts the oldest frame on overflow
pub struct FrameRing {
    queue: ArrayQueue<Arc<VideoFrame>>,
    evicted: AtomicUsize,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            evicted: AtomicUsize::new(0),
        }
    }

    /// Push a frame, evicting the oldest one if the ring is full
    pub fn push(&self, frame: Arc<VideoFrame>) {
        if self.queue.force_push(frame).is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&self) -> Option<Arc<VideoFrame>> {
        self.queue.pop()
    }

    /// Take everything currently queued, oldest first
    pub fn drain(&self) -> Vec<Arc<VideoFrame>> {
        let mut frames = Vec::with_capacity(self.queue.len());
        while let Some(frame) = self.queue.pop() {
            frames.push(frame);
        }
        frames
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn evicted_count(&self) -> usize {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Latest frame for local preview, `None` once capture stops
pub type PreviewReceiver = watch::Receiver<Option<Arc<VideoFrame>>>;

struct FeedInner {
    frames: FrameRing,
    active: AtomicBool,
    preview: watch::Sender<Option<Arc<VideoFrame>>>,
    sequence: AtomicU64,
    started: Instant,
}

/// Producer side of a live stream
///
/// Cheap to clone; every clone feeds the same ring and preview channel.
#[derive(Clone)]
pub struct FrameFeed {
    inner: Arc<FeedInner>,
}

impl FrameFeed {
    pub fn new(capacity: usize) -> Self {
        let (preview, _) = watch::channel(None);
        Self {
            inner: Arc::new(FeedInner {
                frames: FrameRing::new(capacity),
                active: AtomicBool::new(true),
                preview,
                sequence: AtomicU64::new(0),
                started: Instant::now(),
            }),
        }
    }

    /// Stamp and publish a frame to both the encoder ring and the preview
    pub fn publish(&self, image: RgbImage) -> Option<Arc<VideoFrame>> {
        if !self.is_active() {
            return None;
        }
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp_us = self.inner.started.elapsed().as_micros() as u64;
        let frame = Arc::new(VideoFrame::new(image, sequence, timestamp_us));
        self.inner.frames.push(frame.clone());
        self.inner.preview.send_replace(Some(frame.clone()));
        Some(frame)
    }

    /// Mark the feed finished; the encoder's chunk stream ends after this
    pub fn close(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            self.inner.preview.send_replace(None);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn frames_published(&self) -> u64 {
        self.inner.sequence.load(Ordering::Relaxed)
    }

    pub fn tap(&self) -> FrameTap {
        FrameTap { feed: self.clone() }
    }

    pub fn preview(&self) -> PreviewReceiver {
        self.inner.preview.subscribe()
    }

    pub(crate) fn ring(&self) -> &FrameRing {
        &self.inner.frames
    }
}

/// Consumer side handed to the chunk encoder
#[derive(Clone)]
pub struct FrameTap {
    feed: FrameFeed,
}

impl FrameTap {
    pub fn drain(&self) -> Vec<Arc<VideoFrame>> {
        self.feed.ring().drain()
    }

    pub fn is_active(&self) -> bool {
        self.feed.is_active()
    }

    pub fn evicted_count(&self) -> usize {
        self.feed.ring().evicted_count()
    }

    pub fn frames_published(&self) -> u64 {
        self.feed.frames_published()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Arc<VideoFrame> {
        Arc::new(VideoFrame::new(RgbImage::new(2, 2), seq, seq * 1000))
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = FrameRing::new(2);
        ring.push(frame(0));
        ring.push(frame(1));
        ring.push(frame(2));

        assert_eq!(ring.evicted_count(), 1);
        let seqs: Vec<u64> = ring.drain().iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_feed_publishes_to_preview_and_ring() {
        let feed = FrameFeed::new(4);
        let preview = feed.preview();
        let tap = feed.tap();

        feed.publish(RgbImage::new(4, 3));
        feed.publish(RgbImage::new(4, 3));

        let latest = preview.borrow().clone().unwrap();
        assert_eq!(latest.sequence, 1);
        assert_eq!(tap.drain().len(), 2);
    }

    #[test]
    fn test_closed_feed_rejects_frames() {
        let feed = FrameFeed::new(4);
        let preview = feed.preview();
        feed.close();
        feed.close();

        assert!(feed.publish(RgbImage::new(1, 1)).is_none());
        assert!(!feed.tap().is_active());
        assert!(preview.borrow().is_none());
    }
}
