//! Capture subsystem module

pub mod frame;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use frame::{FrameFeed, FrameRing, FrameTap, PreviewReceiver, VideoFrame};
pub use source::{
    backend_from_config, CaptureBackend, CaptureConstraints, DeviceHandle, ImageDirectoryBackend,
    LiveStream, TestPatternBackend,
};
