//! Codec negotiation against what this runtime can actually encode

use crate::error::CodecError;
use crate::protocol::CodecKind;

/// The set of codecs available to the encoder
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    supported: Vec<CodecKind>,
}

impl CodecRegistry {
    /// Everything built into this crate
    pub fn builtin() -> Self {
        Self {
            supported: vec![CodecKind::Mjpeg, CodecKind::Raw],
        }
    }

    /// A restricted registry, e.g. for a target that cannot run JPEG
    pub fn with_supported(supported: impl IntoIterator<Item = CodecKind>) -> Self {
        Self {
            supported: supported.into_iter().collect(),
        }
    }

    pub fn is_supported(&self, codec: CodecKind) -> bool {
        self.supported.contains(&codec)
    }

    /// Pick the preferred codec, else the declared fallback
    pub fn negotiate(
        &self,
        preferred: CodecKind,
        fallback: Option<CodecKind>,
    ) -> Result<CodecKind, CodecError> {
        if self.is_supported(preferred) {
            return Ok(preferred);
        }
        if let Some(fallback) = fallback {
            if self.is_supported(fallback) {
                tracing::warn!("{} unsupported, falling back to {}", preferred, fallback);
                return Ok(fallback);
            }
        }

        let tried = std::iter::once(preferred)
            .chain(fallback)
            .map(|c| c.mime_type())
            .collect::<Vec<_>>()
            .join(", ");
        Err(CodecError::EncodingUnsupported(tried))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
