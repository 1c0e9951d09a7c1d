//! Network subsystem: WebSocket transport, connection lifecycle and the
//! outbound chunk pump

pub mod connection;
pub mod pump;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionStats, InboundPayload};
pub use pump::{ChunkSink, OutboundPump, PumpCounters, PumpExit, PumpStats};
pub use transport::{BlobHandle, Connector, Transport, WebSocketConnector, WireMessage};
