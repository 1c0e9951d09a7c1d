//! Hand-driven capture backend for tests

use async_trait::async_trait;
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::capture::frame::FrameFeed;
use crate::capture::source::{CaptureBackend, CaptureConstraints, DeviceHandle, LiveStream};
use crate::error::CaptureError;

struct CountingDevice(Arc<AtomicUsize>);

impl DeviceHandle for CountingDevice {
    fn stop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Frames are published by the test through [`FakeCapture::feed`]
#[derive(Default)]
pub struct FakeCapture {
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
    feeds: Mutex<Vec<FrameFeed>>,
    refuse: Mutex<Option<CaptureError>>,
}

impl FakeCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing(error: CaptureError) -> Arc<Self> {
        let capture = Self::default();
        *capture.refuse.lock() = Some(error);
        Arc::new(capture)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Feed of the most recent acquisition
    pub fn feed(&self) -> FrameFeed {
        self.feeds.lock().last().cloned().expect("capture never acquired")
    }

    pub fn publish(&self, width: u32, height: u32) {
        self.feed().publish(RgbImage::new(width, height));
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    fn name(&self) -> &str {
        "fake"
    }

    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LiveStream, CaptureError> {
        if let Some(e) = self.refuse.lock().clone() {
            return Err(e);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let feed = FrameFeed::new(constraints.buffer_capacity);
        self.feeds.lock().push(feed.clone());
        Ok(LiveStream::new(
            "fake",
            feed,
            Box::new(CountingDevice(self.released.clone())),
        ))
    }
}
