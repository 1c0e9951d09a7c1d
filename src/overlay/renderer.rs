//! Detection overlay
//!
//! A self-scheduling render cycle at the display refresh rate: draw the
//! newest local frame, then the newest detection set on top of it, scaled
//! from the reference space into the surface's pixels. The cycle lives
//! until [`OverlayRenderer::stop`]; nothing is redrawn after that.

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::capture::{PreviewReceiver, VideoFrame};
use crate::config::RenderConfig;
use crate::protocol::{BoundingBox, Detection};

/// Coordinate space the remote processor reports boxes in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceSpace {
    pub width: f64,
    pub height: f64,
}

impl From<&RenderConfig> for ReferenceSpace {
    fn from(config: &RenderConfig) -> Self {
        Self {
            width: config.reference_width,
            height: config.reference_height,
        }
    }
}

/// A box in surface pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ScaledBox {
    /// True when any part of the box lies on a `width` x `height` surface
    pub fn intersects(&self, width: u32, height: u32) -> bool {
        self.x < width as f64
            && self.y < height as f64
            && self.x + self.width >= 0.0
            && self.y + self.height >= 0.0
    }
}

/// Map a reference-space box onto a `width` x `height` surface
pub fn scale_box(bbox: &BoundingBox, reference: ReferenceSpace, surface: (u32, u32)) -> ScaledBox {
    let sx = surface.0 as f64 / reference.width;
    let sy = surface.1 as f64 / reference.height;
    ScaledBox {
        x: bbox.x * sx,
        y: bbox.y * sy,
        width: bbox.width * sx,
        height: bbox.height * sy,
    }
}

/// The authoritative detection set. Each update replaces the previous one.
#[derive(Clone, Default)]
pub struct DetectionStore {
    current: Arc<RwLock<Arc<Vec<Detection>>>>,
    updates: Arc<AtomicU64>,
}

impl DetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, detections: Vec<Detection>) {
        *self.current.write() = Arc::new(detections);
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn latest(&self) -> Arc<Vec<Detection>> {
        self.current.read().clone()
    }

    pub fn clear(&self) {
        *self.current.write() = Arc::new(Vec::new());
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

/// Drawing target for one render cycle
pub trait OverlaySurface: Send + 'static {
    /// Draw the raw frame; returns the surface size in pixels
    fn begin(&mut self, frame: &VideoFrame) -> (u32, u32);

    fn draw_detection(&mut self, scaled: &ScaledBox, detection: &Detection);

    fn present(&mut self);
}

/// A label to be drawn next to a box
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayLabel {
    pub text: String,
    pub x: f64,
    pub y: f64,
}

/// One finished overlay frame
#[derive(Debug, Clone)]
pub struct Composite {
    pub image: RgbImage,
    pub labels: Vec<OverlayLabel>,
    pub source_sequence: u64,
}

pub type CompositeReceiver = watch::Receiver<Option<Arc<Composite>>>;

/// Composes onto an in-memory RGB canvas and publishes the result
pub struct ImageSurface {
    output: Arc<watch::Sender<Option<Arc<Composite>>>>,
    size: Option<(u32, u32)>,
    canvas: RgbImage,
    labels: Vec<OverlayLabel>,
    source_sequence: u64,
}

const PALETTE: [Rgb<u8>; 6] = [
    Rgb([255, 64, 64]),
    Rgb([64, 255, 64]),
    Rgb([64, 128, 255]),
    Rgb([255, 200, 0]),
    Rgb([255, 0, 255]),
    Rgb([0, 255, 255]),
];

const LINE_WIDTH: u32 = 2;

impl ImageSurface {
    /// Surface at the native frame size
    pub fn new(output: Arc<watch::Sender<Option<Arc<Composite>>>>) -> Self {
        Self {
            output,
            size: None,
            canvas: RgbImage::new(0, 0),
            labels: Vec::new(),
            source_sequence: 0,
        }
    }

    /// Surface of a fixed display size; frames are stretched to fit
    pub fn with_size(output: Arc<watch::Sender<Option<Arc<Composite>>>>, width: u32, height: u32) -> Self {
        Self {
            size: Some((width, height)),
            ..Self::new(output)
        }
    }

    fn outline(&mut self, scaled: &ScaledBox, color: Rgb<u8>) {
        let (w, h) = self.canvas.dimensions();
        if w == 0 || h == 0 {
            return;
        }
        let clamp_x = |v: f64| v.round().clamp(0.0, (w - 1) as f64) as u32;
        let clamp_y = |v: f64| v.round().clamp(0.0, (h - 1) as f64) as u32;
        let (x0, x1) = (clamp_x(scaled.x), clamp_x(scaled.x + scaled.width));
        let (y0, y1) = (clamp_y(scaled.y), clamp_y(scaled.y + scaled.height));

        for t in 0..LINE_WIDTH {
            for x in x0..=x1 {
                self.canvas.put_pixel(x, (y0 + t).min(h - 1), color);
                self.canvas.put_pixel(x, y1.saturating_sub(t), color);
            }
            for y in y0..=y1 {
                self.canvas.put_pixel((x0 + t).min(w - 1), y, color);
                self.canvas.put_pixel(x1.saturating_sub(t), y, color);
            }
        }
    }
}

impl OverlaySurface for ImageSurface {
    fn begin(&mut self, frame: &VideoFrame) -> (u32, u32) {
        self.canvas = match self.size {
            Some((w, h)) if (w, h) != frame.image.dimensions() => {
                image::imageops::resize(&frame.image, w, h, FilterType::Nearest)
            }
            _ => frame.image.clone(),
        };
        self.labels.clear();
        self.source_sequence = frame.sequence;
        self.canvas.dimensions()
    }

    fn draw_detection(&mut self, scaled: &ScaledBox, detection: &Detection) {
        let (w, h) = self.canvas.dimensions();
        if !scaled.intersects(w, h) {
            return;
        }
        let color = PALETTE[detection.id.rem_euclid(PALETTE.len() as i64) as usize];
        self.outline(scaled, color);

        let text = match detection.confidence {
            Some(c) => format!("{} {:.0}%", detection.label, c * 100.0),
            None => detection.label.clone(),
        };
        self.labels.push(OverlayLabel {
            text,
            x: scaled.x,
            y: scaled.y,
        });
    }

    fn present(&mut self) {
        let composite = Composite {
            image: std::mem::replace(&mut self.canvas, RgbImage::new(0, 0)),
            labels: std::mem::take(&mut self.labels),
            source_sequence: self.source_sequence,
        };
        self.output.send_replace(Some(Arc::new(composite)));
    }
}

/// Owns the render cycle task
pub struct OverlayRenderer {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    frames_rendered: Arc<AtomicU64>,
}

impl OverlayRenderer {
    pub fn start(
        preview: PreviewReceiver,
        mut surface: Box<dyn OverlaySurface>,
        detections: DetectionStore,
        config: &RenderConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let reference = ReferenceSpace::from(config);
        let period = config.frame_interval();

        let task_cancel = cancel.clone();
        let task_rendered = frames_rendered.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(frame) = preview.borrow().clone() else {
                            continue;
                        };
                        let size = surface.begin(&frame);
                        for detection in detections.latest().iter() {
                            surface.draw_detection(&scale_box(&detection.bbox, reference, size), detection);
                        }
                        surface.present();
                        task_rendered.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            tracing::debug!("Overlay render cycle stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
            frames_rendered,
        }
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn frames_rendered_handle(&self) -> Arc<AtomicU64> {
        self.frames_rendered.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Cancel the cycle and wait for it to exit
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for OverlayRenderer {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
