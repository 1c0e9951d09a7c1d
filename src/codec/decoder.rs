//! Receive-side chunk decoding
//!
//! The remote processor replies with media in the same containers the
//! encoder produces. Playback only ever shows the newest frame of a chunk,
//! so decoding is on demand: split the chunk, decode the last frame.

use bytes::{Buf, Bytes};
use image::RgbImage;

use crate::error::CodecError;
use crate::protocol::CodecKind;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Split an MJPEG chunk into its complete JPEG images
pub fn split_mjpeg(data: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while let Some(start) = find(&data[pos..], &SOI).map(|i| pos + i) {
        match find(&data[start + 2..], &EOI) {
            Some(end) => {
                let end = start + 2 + end + 2;
                frames.push(&data[start..end]);
                pos = end;
            }
            // Truncated trailing image
            None => break,
        }
    }
    frames
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

/// Parse a raw chunk into `(width, height, rgb)` frames
pub fn split_raw(data: &[u8]) -> Result<Vec<(u32, u32, &[u8])>, CodecError> {
    let mut frames = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 8 {
            return Err(CodecError::DecodingFailed("truncated raw frame header".into()));
        }
        let mut header = &rest[..8];
        let width = header.get_u32();
        let height = header.get_u32();
        let len = width as usize * height as usize * 3;
        if rest.len() < 8 + len {
            return Err(CodecError::DecodingFailed(format!(
                "raw frame {}x{} needs {} bytes, {} left",
                width,
                height,
                len,
                rest.len() - 8
            )));
        }
        frames.push((width, height, &rest[8..8 + len]));
        rest = &rest[8 + len..];
    }
    Ok(frames)
}

/// Decodes received chunks into displayable frames
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    frames_decoded: u64,
    chunks_failed: u64,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the newest complete frame in a chunk
    pub fn decode_latest(&mut self, data: &Bytes) -> Result<Option<RgbImage>, CodecError> {
        let result = match CodecKind::sniff(data) {
            Some(CodecKind::Mjpeg) => self.decode_latest_mjpeg(data),
            Some(CodecKind::Raw) => self.decode_latest_raw(data),
            None => Err(CodecError::DecodingFailed(format!("unrecognized {}-byte chunk", data.len()))),
        };
        if result.is_err() {
            self.chunks_failed += 1;
        }
        result
    }

    fn decode_latest_mjpeg(&mut self, data: &[u8]) -> Result<Option<RgbImage>, CodecError> {
        let Some(last) = split_mjpeg(data).pop() else {
            return Ok(None);
        };
        let image = image::load_from_memory_with_format(last, image::ImageFormat::Jpeg)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        self.frames_decoded += 1;
        Ok(Some(image.to_rgb8()))
    }

    fn decode_latest_raw(&mut self, data: &[u8]) -> Result<Option<RgbImage>, CodecError> {
        let Some((width, height, rgb)) = split_raw(data)?.pop() else {
            return Ok(None);
        };
        let image = RgbImage::from_raw(width, height, rgb.to_vec())
            .ok_or_else(|| CodecError::DecodingFailed("raw frame size mismatch".into()))?;
        self.frames_decoded += 1;
        Ok(Some(image))
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            chunks_failed: self.chunks_failed,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub chunks_failed: u64,
}
