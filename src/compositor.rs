//! Flattens a layer stack into a single RGBA raster.
//!
//! Rendering is deterministic: the same document always produces the same
//! bytes, regardless of thread count, so downstream caches can key on the
//! document's dirty generation alone.

use std::sync::Arc;

use image::{imageops, GrayImage, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::canvas::{blend_pixel, Affine, Document, Layer, Rect};

// ============================================================================
// PREPARED LAYERS
// ============================================================================

/// Per-layer state hoisted out of the pixel loop: the transform stays as-is
/// (inversion happens per sample and is exact), the bounding box prunes rows
/// and pixels the layer cannot touch.
struct Prepared<'a> {
    pixels: &'a RgbaImage,
    mask: Option<&'a GrayImage>,
    transform: Affine,
    opacity: f32,
    blend_mode: crate::canvas::BlendMode,
    bounds: Rect,
    /// Untransformed layers skip the bilinear path entirely and reproduce
    /// their pixels exactly.
    direct: bool,
}

fn prepare(doc: &Document) -> Vec<Prepared<'_>> {
    doc.layers
        .iter()
        .filter(|l| l.visible && l.opacity > 0.0)
        .map(|l: &Layer| Prepared {
            pixels: &l.pixels,
            mask: l.mask.as_deref(),
            transform: l.transform,
            opacity: l.opacity,
            blend_mode: l.blend_mode,
            bounds: l.bounds(),
            direct: l.transform.is_identity(),
        })
        .collect()
}

// ============================================================================
// SAMPLING
// ============================================================================

/// Bilinear RGBA sample at layer-local coordinates. Out-of-bounds neighbours
/// contribute transparent black, so edges fade rather than smear.
fn sample_rgba(img: &RgbaImage, x: f32, y: f32) -> [f32; 4] {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let fetch = |ix: i64, iy: i64| -> [f32; 4] {
        if ix < 0 || iy < 0 || ix >= img.width() as i64 || iy >= img.height() as i64 {
            [0.0; 4]
        } else {
            let p = img.get_pixel(ix as u32, iy as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32, p[3] as f32]
        }
    };

    let x0 = x0 as i64;
    let y0 = y0 as i64;
    let p00 = fetch(x0, y0);
    let p10 = fetch(x0 + 1, y0);
    let p01 = fetch(x0, y0 + 1);
    let p11 = fetch(x0 + 1, y0 + 1);

    let mut out = [0.0f32; 4];
    for c in 0..4 {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bot = p01[c] * (1.0 - fx) + p11[c] * fx;
        out[c] = top * (1.0 - fy) + bot * fy;
    }
    out
}

/// Bilinear grayscale sample, normalised to [0, 1]. Out-of-bounds reads as
/// fully opaque so a mask only ever hides pixels it actually covers.
fn sample_mask(img: &GrayImage, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let fetch = |ix: i64, iy: i64| -> f32 {
        if ix < 0 || iy < 0 || ix >= img.width() as i64 || iy >= img.height() as i64 {
            255.0
        } else {
            img.get_pixel(ix as u32, iy as u32)[0] as f32
        }
    };

    let x0 = x0 as i64;
    let y0 = y0 as i64;
    let top = fetch(x0, y0) * (1.0 - fx) + fetch(x0 + 1, y0) * fx;
    let bot = fetch(x0, y0 + 1) * (1.0 - fx) + fetch(x0 + 1, y0 + 1) * fx;
    (top * (1.0 - fy) + bot * fy) / 255.0
}

// ============================================================================
// RENDER
// ============================================================================

/// Flatten the document into an RGBA image at canvas resolution. Hidden and
/// fully-transparent layers are skipped; each remaining layer is sampled
/// through its inverse transform and blended bottom-up.
pub fn render(doc: &Document) -> RgbaImage {
    let width = doc.width;
    let height = doc.height;
    let mut out = RgbaImage::new(width, height);
    let layers = prepare(doc);
    if layers.is_empty() {
        return out;
    }

    let buf: &mut [u8] = &mut out;
    buf.par_chunks_exact_mut(width as usize * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let yf = y as f32;
            for x in 0..width as usize {
                let xf = x as f32;
                let mut px = Rgba([0u8, 0, 0, 0]);

                for layer in &layers {
                    if !layer.bounds.contains(xf, yf) {
                        continue;
                    }
                    let (sampled, mask_f) = if layer.direct {
                        let (ix, iy) = (x as u32, y as u32);
                        if ix >= layer.pixels.width() || iy >= layer.pixels.height() {
                            continue;
                        }
                        let m = layer
                            .mask
                            .map(|m| m.get_pixel(ix, iy)[0] as f32 / 255.0)
                            .unwrap_or(1.0);
                        (*layer.pixels.get_pixel(ix, iy), m)
                    } else {
                        let (lx, ly) = layer.transform.invert(xf, yf);
                        let s = sample_rgba(layer.pixels, lx, ly);
                        if s[3] <= 0.0 {
                            continue;
                        }
                        let m = layer.mask.map(|m| sample_mask(m, lx, ly)).unwrap_or(1.0);
                        (
                            Rgba([
                                s[0].round() as u8,
                                s[1].round() as u8,
                                s[2].round() as u8,
                                s[3].round() as u8,
                            ]),
                            m,
                        )
                    };

                    px = blend_pixel(px, sampled, layer.blend_mode, layer.opacity * mask_f);
                }

                let off = x * 4;
                row[off..off + 4].copy_from_slice(&px.0);
            }
        });

    out
}

/// Flatten and resize to the requested dimensions. A matching target is a
/// plain render; otherwise the flattened canvas is resampled with a triangle
/// filter.
pub fn render_scaled(doc: &Document, target_width: u32, target_height: u32) -> RgbaImage {
    let full = render(doc);
    if target_width == doc.width && target_height == doc.height {
        return full;
    }
    imageops::resize(&full, target_width, target_height, imageops::FilterType::Triangle)
}

/// Flatten the document's mask channel. Starts from the document-wide mask
/// (fully opaque when none was painted) and composites each visible layer's
/// mask on top, weighted by that layer's sampled alpha and opacity:
///
///   acc = acc * (1 - a) + layer_mask * a
///
/// Layers without a mask contribute full coverage wherever they have alpha.
pub fn render_mask(doc: &Document) -> GrayImage {
    let width = doc.width;
    let height = doc.height;

    let mut out = match &doc.mask {
        Some(m) if m.width() == width && m.height() == height => m.clone(),
        _ => GrayImage::from_pixel(width, height, image::Luma([255u8])),
    };

    let layers = prepare(doc);
    if layers.is_empty() {
        return out;
    }

    let buf: &mut [u8] = &mut out;
    buf.par_chunks_exact_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let yf = y as f32;
            for x in 0..width as usize {
                let xf = x as f32;
                let mut acc = row[x] as f32 / 255.0;

                for layer in &layers {
                    if !layer.bounds.contains(xf, yf) {
                        continue;
                    }
                    let (alpha, m) = if layer.direct {
                        let (ix, iy) = (x as u32, y as u32);
                        if ix >= layer.pixels.width() || iy >= layer.pixels.height() {
                            continue;
                        }
                        let a = layer.pixels.get_pixel(ix, iy)[3] as f32 / 255.0;
                        let m = layer
                            .mask
                            .map(|mk| mk.get_pixel(ix, iy)[0] as f32 / 255.0)
                            .unwrap_or(1.0);
                        (a, m)
                    } else {
                        let (lx, ly) = layer.transform.invert(xf, yf);
                        let s = sample_rgba(layer.pixels, lx, ly);
                        let m = layer.mask.map(|mk| sample_mask(mk, lx, ly)).unwrap_or(1.0);
                        (s[3] / 255.0, m)
                    };

                    let a = alpha * layer.opacity;
                    if a <= 0.0 {
                        continue;
                    }
                    acc = acc * (1.0 - a) + m * a;
                }

                row[x] = (acc.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        });

    out
}

// ============================================================================
// PREVIEW CACHE
// ============================================================================

/// Memoised flatten keyed on the document's dirty generation. A hit returns
/// the shared image without touching a pixel; any document mutation bumps the
/// generation and invalidates the cache.
#[derive(Default)]
pub struct PreviewCache {
    generation: Option<u64>,
    image: Option<Arc<RgbaImage>>,
}

impl PreviewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flattened document, rendered at most once per generation.
    pub fn composite(&mut self, doc: &Document) -> Arc<RgbaImage> {
        if self.generation == Some(doc.dirty_generation)
            && let Some(img) = &self.image
        {
            return Arc::clone(img);
        }
        let img = Arc::new(render(doc));
        self.generation = Some(doc.dirty_generation);
        self.image = Some(Arc::clone(&img));
        img
    }

    pub fn invalidate(&mut self) {
        self.generation = None;
        self.image = None;
    }

    pub fn is_warm(&self, doc: &Document) -> bool {
        self.generation == Some(doc.dirty_generation) && self.image.is_some()
    }
}

// ============================================================================
// TESTS
// ============================================================================
