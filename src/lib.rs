//! # Vision Stream Client
//!
//! Real-time bidirectional camera streaming over a persistent WebSocket.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          SessionController                               │
//! │                                                                          │
//! │  ┌─────────────┐   ┌─────────────┐   ┌──────────────┐                    │
//! │  │  Capture    │──▶│   Chunk     │──▶│   Outbound   │──┐                 │
//! │  │  (capture)  │   │  Encoder    │   │    Pump      │  │                 │
//! │  └──────┬──────┘   └─────────────┘   └──────────────┘  │                 │
//! │         │ preview                                      ▼                 │
//! │         │                                    ┌──────────────────┐        │
//! │         │                                    │ ConnectionManager│◀──▶ ws │
//! │         │                                    │  (reconnecting)  │        │
//! │         │                                    └────────┬─────────┘        │
//! │         │                                             │ events           │
//! │         │                                             ▼                  │
//! │         │                                    ┌──────────────────┐        │
//! │         │                                    │ InboundDispatcher│        │
//! │         │                                    └───┬──────────┬───┘        │
//! │         │                        MediaChunk      │          │ Detections │
//! │         │                          ┌─────────────┘          │            │
//! │         ▼                          ▼                        ▼            │
//! │  ┌─────────────┐          ┌─────────────────┐      ┌─────────────────┐   │
//! │  │   Overlay   │◀─────────┼─────────────────┼──────│  latest boxes   │   │
//! │  │  Renderer   │          │ PlaybackBuffer  │      └─────────────────┘   │
//! │  └─────────────┘          │ (timeline sink) │                            │
//! │                           └─────────────────┘                            │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every component runs as a task on one cooperative event loop; the
//! controller's supervisor task is the single place where connection
//! events, reconnect timers and inbound messages are handled, in arrival
//! order.

pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod overlay;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default streaming endpoint
    pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws";

    /// Default slice interval for outbound chunks in milliseconds
    pub const DEFAULT_SLICE_INTERVAL_MS: u64 = 250;

    /// Delay before a reconnect attempt after an abnormal closure
    pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

    /// Upper bound on consecutive failed reconnect attempts
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

    /// Bounded wait for the first connection during startup
    pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5000;

    /// Consecutive per-chunk encode errors that escalate to a fatal failure
    pub const DEFAULT_MAX_CONSECUTIVE_ENCODE_ERRORS: u32 = 3;

    /// Outbound messages the socket writer may hold
    pub const DEFAULT_SEND_QUEUE_DEPTH: usize = 8;

    /// Capture defaults
    pub const DEFAULT_WIDTH: u32 = 640;
    pub const DEFAULT_HEIGHT: u32 = 480;
    pub const DEFAULT_FPS: u32 = 15;

    /// Captured frames held between encoder slices
    pub const FRAME_BUFFER_CAPACITY: usize = 64;

    /// Render cycle rate for the overlay
    pub const DEFAULT_REFRESH_HZ: u32 = 60;

    /// Coordinate space detections are reported in
    pub const REFERENCE_WIDTH: f64 = 640.0;
    pub const REFERENCE_HEIGHT: f64 = 640.0;

    /// Close code for a deliberate shutdown
    pub const CLOSE_NORMAL: u16 = 1000;

    /// Close code reported when the socket vanished without a close frame
    pub const CLOSE_ABNORMAL: u16 = 1006;

    /// Default port for the status UI
    pub const DEFAULT_UI_PORT: u16 = 8090;
}
