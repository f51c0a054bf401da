//! Image encoding collaborator.
//!
//! Resizing and re-encoding bitmaps is left to the caller; the bridge only needs the
//! final bytes turned into a base64 string.

use base64::Engine as _;
use base64::engine::general_purpose;

/// Media type assumed for attachments when none is supplied.
pub const DEFAULT_IMAGE_MEDIA_TYPE: &str = "image/jpeg";

/// Turns image bytes into the base64 text embedded in request bodies.
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, bytes: &[u8]) -> String;

    /// MIME type of the bytes this encoder receives.
    fn media_type(&self) -> &str {
        DEFAULT_IMAGE_MEDIA_TYPE
    }
}

/// Standard-alphabet, padded base64 with no preprocessing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64ImageEncoder;

impl ImageEncoder for Base64ImageEncoder {
    fn encode(&self, bytes: &[u8]) -> String {
        general_purpose::STANDARD.encode(bytes)
    }
}
