//! PNG data-URI codecs for the wire protocol.
//!
//! Every image crossing the sync channel travels as a
//! `data:image/png;base64,` string: self-describing, JSON-safe, and identical
//! to what browser canvases emit.

use std::fmt;
use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};

const DATA_URI_PREFIX: &str = "data:image/png;base64,";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum EncodeError {
    /// The string does not start with a `data:` scheme or has no payload.
    NotADataUri,
    Base64(base64::DecodeError),
    Png(image::ImageError),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::NotADataUri => write!(f, "Not a data URI"),
            EncodeError::Base64(e) => write!(f, "Base64 decode error: {}", e),
            EncodeError::Png(e) => write!(f, "PNG codec error: {}", e),
        }
    }
}

impl std::error::Error for EncodeError {}

impl From<base64::DecodeError> for EncodeError {
    fn from(e: base64::DecodeError) -> Self {
        EncodeError::Base64(e)
    }
}

impl From<image::ImageError> for EncodeError {
    fn from(e: image::ImageError) -> Self {
        EncodeError::Png(e)
    }
}

// ============================================================================
// ENCODING
// ============================================================================

fn encode_png(img: &DynamicImage) -> Result<String, EncodeError> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(format!("{}{}", DATA_URI_PREFIX, STANDARD.encode(&bytes)))
}

/// Encode an RGBA image as a PNG data URI.
pub fn encode_rgba_data_uri(img: &RgbaImage) -> Result<String, EncodeError> {
    encode_png(&DynamicImage::ImageRgba8(img.clone()))
}

/// Encode a grayscale mask as a PNG data URI.
pub fn encode_gray_data_uri(img: &GrayImage) -> Result<String, EncodeError> {
    encode_png(&DynamicImage::ImageLuma8(img.clone()))
}

/// Wrap raw, already-encoded image file bytes in a data URI without
/// re-encoding them. The mime stays `image/png`; consumers sniff the real
/// format from the payload.
pub fn encode_raw_bytes_data_uri(bytes: &[u8]) -> String {
    format!("{}{}", DATA_URI_PREFIX, STANDARD.encode(bytes))
}

// ============================================================================
// DECODING
// ============================================================================

/// Strip the `data:<mime>;base64,` header and decode the payload bytes.
fn decode_payload(uri: &str) -> Result<Vec<u8>, EncodeError> {
    if !uri.starts_with("data:") {
        return Err(EncodeError::NotADataUri);
    }
    let payload = uri.split_once(',').ok_or(EncodeError::NotADataUri)?.1;
    Ok(STANDARD.decode(payload)?)
}

/// Decode a data URI into an RGBA image, converting from whatever pixel
/// format the payload carries.
pub fn decode_image_data_uri(uri: &str) -> Result<RgbaImage, EncodeError> {
    let bytes = decode_payload(uri)?;
    let img = image::load_from_memory(&bytes)?;
    Ok(img.to_rgba8())
}

/// Decode a data URI into a grayscale mask.
pub fn decode_mask_data_uri(uri: &str) -> Result<GrayImage, EncodeError> {
    let bytes = decode_payload(uri)?;
    let img = image::load_from_memory(&bytes)?;
    Ok(img.to_luma8())
}

// ============================================================================
// TESTS
// ============================================================================
