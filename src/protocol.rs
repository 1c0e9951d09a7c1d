//! Wire-level types shared by the send and receive paths
//!
//! Outbound traffic is nothing but binary chunks, one per WebSocket
//! message. Inbound traffic is either binary media in the same container
//! the encoder produced, or a UTF-8 JSON array of detections:
//!
//! ```text
//! [{ "id": 1, "label": "cat", "box": [10, 20, 100, 80], "confidence": 0.92 }]
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// One time slice of encoded media
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Monotonically increasing, assigned at encode time, diagnostics only
    pub sequence: u64,
    /// Codec the payload was encoded with
    pub codec: CodecKind,
    /// Number of frames packed into the slice
    pub frame_count: usize,
    /// Encoded payload
    pub data: Bytes,
    /// When the slice was sealed
    pub created_at: Instant,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Built-in media codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// Concatenated baseline JPEG images
    Mjpeg,
    /// Length-prefixed raw RGB frames
    Raw,
}

impl CodecKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            CodecKind::Mjpeg => "video/x-motion-jpeg",
            CodecKind::Raw => "video/x-raw-rgb",
        }
    }

    /// Guess the codec of a received chunk from its leading bytes
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.len() >= 2 && data[0] == 0xFF && data[1] == 0xD8 {
            Some(CodecKind::Mjpeg)
        } else if data.len() >= 8 {
            Some(CodecKind::Raw)
        } else {
            None
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

/// Axis-aligned box, serialized as `[x, y, width, height]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from([x, y, width, height]: [f64; 4]) -> Self {
        Self { x, y, width, height }
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

/// One labeled region reported by the remote processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: i64,
    pub label: String,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Detection {
    /// Clamp confidence into [0, 1]; NaN is treated as absent
    pub fn normalized(mut self) -> Self {
        self.confidence = self
            .confidence
            .filter(|c| !c.is_nan())
            .map(|c| c.clamp(0.0, 1.0));
        self
    }
}

/// A classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Binary media to append to the playback timeline
    MediaChunk(Bytes),
    /// Authoritative replacement for the current detections
    DetectionSet(Vec<Detection>),
    /// Neither media nor a detection array
    Unrecognized(String),
}

/// Lifecycle of the single transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    /// Closed by this client on purpose
    pub deliberate: bool,
}

impl CloseInfo {
    pub fn deliberate(code: u16) -> Self {
        Self { code, deliberate: true }
    }

    pub fn remote(code: u16) -> Self {
        Self { code, deliberate: false }
    }

    /// Abnormal closures are the only ones that trigger a reconnect
    pub fn is_abnormal(&self) -> bool {
        !self.deliberate && self.code != crate::constants::CLOSE_NORMAL
    }
}
