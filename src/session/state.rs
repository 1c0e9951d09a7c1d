//! Session status as observed from outside the controller

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::codec::EncoderStats;
use crate::network::{ConnectionStats, PumpStats};
use crate::playback::{DispatchStats, PlaybackStats};
use crate::protocol::ConnectionState;

/// Lifecycle of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    /// Capture live and transport connected
    Streaming,
    /// Capture live, transport down and a reconnect pending
    Degraded,
    Stopping,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Streaming => "streaming",
            SessionState::Degraded => "degraded",
            SessionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// One streaming session, from start to stop
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
            started_at: Utc::now(),
        }
    }
}

/// Snapshot published on every session or connection state change.
///
/// `state` and `connection` are always updated together, so an observer
/// never sees `Streaming` without `Connected`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub connection: ConnectionState,
    pub endpoint: String,
    pub started_at: Option<DateTime<Utc>>,
    /// Most recent fatal or degrading error, cleared on recovery
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}

impl SessionStatus {
    pub fn idle(endpoint: impl Into<String>) -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            connection: ConnectionState::Disconnected,
            endpoint: endpoint.into(),
            started_at: None,
            last_error: None,
            reconnect_attempts: 0,
        }
    }
}

/// Counters of the current (or most recent) session
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub session_id: Option<Uuid>,
    pub frames_captured: u64,
    pub encoder: EncoderStats,
    pub pump: PumpStats,
    pub connection: ConnectionStats,
    pub inbound: DispatchStats,
    pub playback: PlaybackStats,
    pub overlay_frames: u64,
    pub detection_updates: u64,
}
