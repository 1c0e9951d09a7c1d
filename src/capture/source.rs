//! Capture backends and the live stream handle
//!
//! A backend acquires a device and returns a [`LiveStream`]. The stream
//! owns the device handle exclusively; [`LiveStream::release`] stops the
//! device and may be called any number of times. Dropping the stream
//! releases it as well, so every exit path gives the device back.

use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::capture::frame::{FrameFeed, FrameTap, PreviewReceiver};
use crate::config::{CaptureConfig, CaptureSourceKind};
use crate::error::CaptureError;

/// Requested capture format. Backends treat these as hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_capacity: usize,
}

impl From<&CaptureConfig> for CaptureConstraints {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
            buffer_capacity: config.frame_buffer_capacity,
        }
    }
}

impl CaptureConstraints {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

/// Something that can open a capture device
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LiveStream, CaptureError>;
}

/// The underlying device, stopped exactly once by [`LiveStream::release`]
pub trait DeviceHandle: Send {
    fn stop(&mut self);
}

/// An acquired, continuously updating capture
pub struct LiveStream {
    device: Option<Box<dyn DeviceHandle>>,
    feed: FrameFeed,
    error_rx: Option<Receiver<CaptureError>>,
    backend: String,
}

impl LiveStream {
    pub fn new(backend: impl Into<String>, feed: FrameFeed, device: Box<dyn DeviceHandle>) -> Self {
        Self {
            device: Some(device),
            feed,
            error_rx: None,
            backend: backend.into(),
        }
    }

    fn with_errors(mut self, error_rx: Receiver<CaptureError>) -> Self {
        self.error_rx = Some(error_rx);
        self
    }

    /// Frame source for the chunk encoder
    pub fn tap(&self) -> FrameTap {
        self.feed.tap()
    }

    /// Raw local preview surface
    pub fn preview(&self) -> PreviewReceiver {
        self.feed.preview()
    }

    pub fn is_active(&self) -> bool {
        self.device.is_some() && self.feed.is_active()
    }

    pub fn frames_captured(&self) -> u64 {
        self.feed.frames_published()
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Check for errors raised by the capture thread
    pub fn check_errors(&self) -> Option<CaptureError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    /// Stop the device. Returns false if it was already released.
    pub fn release(&mut self) -> bool {
        match self.device.take() {
            Some(mut device) => {
                device.stop();
                self.feed.close();
                tracing::info!("Released capture device ({})", self.backend);
                true
            }
            None => false,
        }
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Produces one frame per tick on the capture thread
pub trait FrameProducer: Send + 'static {
    fn next_frame(&mut self) -> Result<RgbImage, CaptureError>;
}

/// Dedicated thread pacing a [`FrameProducer`] at the requested frame rate.
///
/// The thread waits between frames on a stop channel, so stopping never
/// waits out a whole frame interval.
pub struct CaptureThread {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    pub fn spawn<P: FrameProducer>(
        name: &str,
        mut producer: P,
        feed: FrameFeed,
        interval: Duration,
        error_tx: Sender<CaptureError>,
    ) -> Result<Self, CaptureError> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || {
                let mut next_tick = Instant::now();
                loop {
                    match producer.next_frame() {
                        Ok(image) => {
                            feed.publish(image);
                        }
                        Err(e) => {
                            tracing::error!("Capture failed: {}", e);
                            let _ = error_tx.try_send(e);
                            break;
                        }
                    }

                    next_tick += interval;
                    let now = Instant::now();
                    let wait = if next_tick > now {
                        next_tick - now
                    } else {
                        next_tick = now;
                        Duration::ZERO
                    };
                    // Disconnected means stopped
                    if !matches!(stop_rx.recv_timeout(wait), Err(RecvTimeoutError::Timeout)) {
                        break;
                    }
                }
                // Device gone or stopped: end the chunk stream either way
                feed.close();
            })
            .map_err(|e| CaptureError::StreamError(e.to_string()))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl DeviceHandle for CaptureThread {
    fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Synthetic moving gradient, a stand-in camera
pub struct TestPatternBackend;

struct TestPattern {
    width: u32,
    height: u32,
    offset: u32,
}

impl FrameProducer for TestPattern {
    fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let offset = self.offset;
        self.offset = self.offset.wrapping_add(4);
        Ok(RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                ((x + offset) % 256) as u8,
                ((y + offset) % 256) as u8,
                (offset % 256) as u8,
            ])
        }))
    }
}

#[async_trait]
impl CaptureBackend for TestPatternBackend {
    fn name(&self) -> &str {
        "test-pattern"
    }

    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LiveStream, CaptureError> {
        if constraints.width == 0 || constraints.height == 0 {
            return Err(CaptureError::DeviceUnavailable(format!(
                "unsupported resolution {}x{}",
                constraints.width, constraints.height
            )));
        }

        let feed = FrameFeed::new(constraints.buffer_capacity);
        let (error_tx, error_rx) = bounded(16);
        let producer = TestPattern {
            width: constraints.width,
            height: constraints.height,
            offset: 0,
        };
        let thread = CaptureThread::spawn(
            self.name(),
            producer,
            feed.clone(),
            constraints.frame_interval(),
            error_tx,
        )?;

        tracing::info!(
            "Test pattern capture started: {}x{} @ {} fps",
            constraints.width,
            constraints.height,
            constraints.fps
        );
        Ok(LiveStream::new(self.name(), feed, Box::new(thread)).with_errors(error_rx))
    }
}

/// Loops over the images in a directory, like a camera pointed at a slideshow
pub struct ImageDirectoryBackend {
    dir: PathBuf,
}

impl ImageDirectoryBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

struct ImageLoop {
    frames: Vec<RgbImage>,
    index: usize,
}

impl FrameProducer for ImageLoop {
    fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let frame = self
            .frames
            .get(self.index % self.frames.len().max(1))
            .cloned()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no frames".into()))?;
        self.index = self.index.wrapping_add(1);
        Ok(frame)
    }
}

fn map_io_error(dir: &Path, e: std::io::Error) -> CaptureError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            CaptureError::PermissionDenied(format!("{}: {}", dir.display(), e))
        }
        _ => CaptureError::DeviceUnavailable(format!("{}: {}", dir.display(), e)),
    }
}

fn load_frames(dir: &Path, width: u32, height: u32) -> Result<Vec<RgbImage>, CaptureError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| map_io_error(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        match image::open(&path) {
            Ok(img) => {
                let rgb = img.to_rgb8();
                let rgb = if rgb.dimensions() == (width, height) {
                    rgb
                } else {
                    image::imageops::resize(&rgb, width, height, FilterType::Triangle)
                };
                frames.push(rgb);
            }
            Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
        }
    }

    if frames.is_empty() {
        return Err(CaptureError::DeviceUnavailable(format!(
            "{} contains no readable images",
            dir.display()
        )));
    }
    Ok(frames)
}

#[async_trait]
impl CaptureBackend for ImageDirectoryBackend {
    fn name(&self) -> &str {
        "image-dir"
    }

    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LiveStream, CaptureError> {
        let dir = self.dir.clone();
        let (width, height) = (constraints.width, constraints.height);
        let frames = tokio::task::spawn_blocking(move || load_frames(&dir, width, height))
            .await
            .map_err(|e| CaptureError::StreamError(e.to_string()))??;

        tracing::info!("Loaded {} frames from {}", frames.len(), self.dir.display());

        let feed = FrameFeed::new(constraints.buffer_capacity);
        let (error_tx, error_rx) = bounded(16);
        let thread = CaptureThread::spawn(
            self.name(),
            ImageLoop { frames, index: 0 },
            feed.clone(),
            constraints.frame_interval(),
            error_tx,
        )?;

        Ok(LiveStream::new(self.name(), feed, Box::new(thread)).with_errors(error_rx))
    }
}

/// Build the backend selected in the configuration
pub fn backend_from_config(config: &CaptureConfig) -> Box<dyn CaptureBackend> {
    match &config.source {
        CaptureSourceKind::TestPattern => Box::new(TestPatternBackend),
        CaptureSourceKind::ImageDir(dir) => Box::new(ImageDirectoryBackend::new(dir.clone())),
    }
}
