//! Remote playback: inbound dispatch and the timeline buffer

pub mod buffer;
pub mod dispatcher;

pub use buffer::{
    DecodingSink, PlaybackBuffer, PlaybackCounters, PlaybackStats, RemoteFrameReceiver, RemoteSurface, SinkState,
    TimelineSink,
};
pub use dispatcher::{classify, classify_text, DispatchCounters, DispatchStats, InboundDispatcher};
