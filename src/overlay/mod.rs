//! Detection overlay on top of the local preview

pub mod renderer;

pub use renderer::{
    scale_box, Composite, CompositeReceiver, DetectionStore, ImageSurface, OverlayLabel, OverlayRenderer,
    OverlaySurface, ReferenceSpace, ScaledBox,
};
