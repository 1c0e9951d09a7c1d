//! Media codecs
//!
//! Slices captured frames into chunks for the wire and decodes the media
//! the remote processor sends back.

pub mod decoder;
pub mod encoder;
pub mod negotiate;

pub use decoder::ChunkDecoder;
pub use encoder::{ChunkEncoder, EncoderCounters, EncoderStats, FrameEncoder};
pub use negotiate::CodecRegistry;
