//! Foreground extraction (matting).
//!
//! The segmentation engine sits behind the [`Segmenter`] trait so the server
//! can run anything from the built-in luminance thresholder to an external
//! model. Only one matting request runs at a time; concurrent callers are
//! rejected as busy rather than queued, because inference latency makes a
//! queue worse than an immediate retry.

use std::fmt;

use image::{GrayImage, Luma, Rgba, RgbaImage};

use crate::encode::{self, EncodeError};
use crate::gate::ExecutionGate;
use crate::log_info;

// ============================================================================
// ERRORS
// ============================================================================

/// Failures inside a segmentation engine.
#[derive(Debug)]
pub enum MattingError {
    /// The engine is not installed or failed to initialise.
    Unavailable(String),
    /// The engine needed a network resource it could not reach.
    Network(String),
    /// The engine started but failed mid-inference.
    Runtime(String),
}

impl fmt::Display for MattingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MattingError::Unavailable(m) => write!(f, "Matting engine unavailable: {}", m),
            MattingError::Network(m) => write!(f, "Matting network error: {}", m),
            MattingError::Runtime(m) => write!(f, "Matting runtime error: {}", m),
        }
    }
}

impl std::error::Error for MattingError {}

/// Failures of a matting *request*, including ones that never reach the
/// engine.
#[derive(Debug)]
pub enum MattingFailure {
    /// Another matting request holds the gate.
    Busy,
    /// Bad input: undecodable URI or out-of-range threshold.
    Validation(String),
    Engine(MattingError),
}

impl fmt::Display for MattingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MattingFailure::Busy => write!(f, "Matting is busy with another request"),
            MattingFailure::Validation(m) => write!(f, "Invalid matting request: {}", m),
            MattingFailure::Engine(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MattingFailure {}

impl From<MattingError> for MattingFailure {
    fn from(e: MattingError) -> Self {
        MattingFailure::Engine(e)
    }
}

impl From<EncodeError> for MattingFailure {
    fn from(e: EncodeError) -> Self {
        MattingFailure::Validation(e.to_string())
    }
}

// ============================================================================
// SEGMENTER
// ============================================================================

/// A foreground/background segmentation engine. Returns a grayscale alpha
/// matte the same size as the input, 255 meaning fully foreground.
pub trait Segmenter {
    fn segment(&self, image: &RgbaImage, threshold: f32) -> Result<GrayImage, MattingError>;
}

/// Built-in engine: normalised luminance, optionally hardened to a binary
/// matte. Threshold 0 keeps the soft matte; anything above snaps each pixel
/// to 0 or 255.
pub struct ThresholdSegmenter;

impl Segmenter for ThresholdSegmenter {
    fn segment(&self, image: &RgbaImage, threshold: f32) -> Result<GrayImage, MattingError> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(MattingError::Runtime("empty input image".to_string()));
        }

        let lum: Vec<f32> = image
            .pixels()
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .collect();

        let min = lum.iter().copied().fold(f32::INFINITY, f32::min);
        let max = lum.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let range = (max - min).max(1e-6);

        let mut matte = GrayImage::new(w, h);
        for (i, p) in matte.pixels_mut().enumerate() {
            let norm = (lum[i] - min) / range;
            let v = if threshold > 0.0 {
                if norm >= threshold { 255 } else { 0 }
            } else {
                (norm * 255.0).round() as u8
            };
            *p = Luma([v]);
        }
        Ok(matte)
    }
}

// ============================================================================
// REQUEST PIPELINE
// ============================================================================

/// Result of a successful matting request: the cut-out image and its alpha
/// matte, both as PNG data URIs.
#[derive(Debug)]
pub struct MattingOutput {
    pub matted_image: String,
    pub alpha_mask: String,
}

/// Run one matting request end to end: admission, validation, segmentation,
/// alpha combination, encoding.
///
/// The matte is combined with the input's own alpha channel by per-pixel
/// minimum, so matting never reveals pixels the source already hid. The
/// matted image keeps its RGB multiplied by the combined alpha.
pub fn run_matting(
    gate: &ExecutionGate,
    segmenter: &dyn Segmenter,
    image_uri: &str,
    threshold: f32,
) -> Result<MattingOutput, MattingFailure> {
    let _permit = gate.try_enter().ok_or(MattingFailure::Busy)?;

    if !(0.0..=1.0).contains(&threshold) || threshold.is_nan() {
        return Err(MattingFailure::Validation(format!(
            "threshold {} outside [0, 1]",
            threshold
        )));
    }

    let source = encode::decode_image_data_uri(image_uri)?;
    log_info!(
        "Matting {}x{} image (threshold {})",
        source.width(),
        source.height(),
        threshold
    );

    let matte = segmenter.segment(&source, threshold)?;
    let (matted, combined) = apply_matte(&source, &matte);

    Ok(MattingOutput {
        matted_image: encode::encode_rgba_data_uri(&matted)?,
        alpha_mask: encode::encode_gray_data_uri(&combined)?,
    })
}

/// Combine the matte with the source's own alpha (per-pixel minimum) and
/// produce the premultiplied cut-out.
fn apply_matte(source: &RgbaImage, matte: &GrayImage) -> (RgbaImage, GrayImage) {
    let (w, h) = source.dimensions();
    let mut combined = GrayImage::new(w, h);
    let mut matted = RgbaImage::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let src = source.get_pixel(x, y);
            let m = matte.get_pixel(x, y)[0].min(src[3]);
            combined.put_pixel(x, y, Luma([m]));

            let f = m as f32 / 255.0;
            matted.put_pixel(
                x,
                y,
                Rgba([
                    (src[0] as f32 * f).round() as u8,
                    (src[1] as f32 * f).round() as u8,
                    (src[2] as f32 * f).round() as u8,
                    m,
                ]),
            );
        }
    }
    (matted, combined)
}

// ============================================================================
// TESTS
// ============================================================================
