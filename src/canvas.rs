use std::sync::Arc;

use image::{GrayImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::history::HistoryEntry;

// ============================================================================
// GEOMETRY
// ============================================================================

/// Axis-aligned rectangle in canvas coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Rect {
    pub fn from_min_max(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Rectangle spanning two arbitrary corners (drag origin + cursor).
    pub fn from_corners(a: (f32, f32), b: (f32, f32)) -> Self {
        Self {
            min_x: a.0.min(b.0),
            min_y: a.1.min(b.1),
            max_x: a.0.max(b.0),
            max_y: a.1.max(b.1),
        }
    }

    pub fn width(&self) -> f32 {
        (self.max_x - self.min_x).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.max_y - self.min_y).max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.min_x + self.max_x) * 0.5, (self.min_y + self.max_y) * 0.5)
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

// ============================================================================
// AFFINE TRANSFORM — explicit components, never a matrix
// ============================================================================

/// Layer placement as explicit translate/scale/rotate components.
///
/// Components are kept separate (rather than a collapsed 2×3 matrix) so that
/// repeated interactive edits stay numerically stable: a hundred small
/// rotations adjust one angle instead of compounding matrix products.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Affine {
    pub tx: f32,
    pub ty: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    /// Rotation in radians, counter-clockwise about the layer origin.
    pub rotation: f32,
}

impl Default for Affine {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Affine {
    pub const IDENTITY: Affine = Affine {
        tx: 0.0,
        ty: 0.0,
        scale_x: 1.0,
        scale_y: 1.0,
        rotation: 0.0,
    };

    pub fn translation(tx: f32, ty: f32) -> Self {
        Affine { tx, ty, ..Self::IDENTITY }
    }

    /// Map a layer-local point into canvas space: scale, then rotate, then
    /// translate.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let sx = x * self.scale_x;
        let sy = y * self.scale_y;
        let (sin, cos) = self.rotation.sin_cos();
        (
            sx * cos - sy * sin + self.tx,
            sx * sin + sy * cos + self.ty,
        )
    }

    /// Exact inverse of [`apply`](Self::apply): untranslate, unrotate,
    /// unscale. Degenerate (zero) scales divide to infinity, which falls
    /// outside every raster bound and therefore samples as transparent.
    pub fn invert(&self, x: f32, y: f32) -> (f32, f32) {
        let dx = x - self.tx;
        let dy = y - self.ty;
        let (sin, cos) = self.rotation.sin_cos();
        let rx = dx * cos + dy * sin;
        let ry = -dx * sin + dy * cos;
        (rx / self.scale_x, ry / self.scale_y)
    }

    /// Canvas-space axis-aligned bounding box of a `w × h` raster under this
    /// transform.
    pub fn bounding_box(&self, w: u32, h: u32) -> Rect {
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(w as f32, 0.0),
            self.apply(0.0, h as f32),
            self.apply(w as f32, h as f32),
        ];
        let mut rect = Rect::from_min_max(corners[0].0, corners[0].1, corners[0].0, corners[0].1);
        for &(x, y) in &corners[1..] {
            rect.min_x = rect.min_x.min(x);
            rect.min_y = rect.min_y.min(y);
            rect.max_x = rect.max_x.max(x);
            rect.max_y = rect.max_y.max(y);
        }
        rect
    }

    /// True when the transform maps raster pixels 1:1 onto canvas pixels.
    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

// ============================================================================
// BLEND MODES — closed set
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Additive,
    Overlay,
    Lighten,
    Darken,
    Difference,
}

impl BlendMode {
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Additive,
            BlendMode::Overlay,
            BlendMode::Lighten,
            BlendMode::Darken,
            BlendMode::Difference,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Additive => "Additive",
            BlendMode::Overlay => "Overlay",
            BlendMode::Lighten => "Lighten",
            BlendMode::Darken => "Darken",
            BlendMode::Difference => "Difference",
        }
    }

    /// Convert to a stable u8 for binary serialization.
    pub fn to_u8(&self) -> u8 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Multiply => 1,
            BlendMode::Screen => 2,
            BlendMode::Additive => 3,
            BlendMode::Overlay => 4,
            BlendMode::Lighten => 5,
            BlendMode::Darken => 6,
            BlendMode::Difference => 7,
        }
    }

    /// Reconstruct from a u8 (defaults to Normal for unknown values).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => BlendMode::Multiply,
            2 => BlendMode::Screen,
            3 => BlendMode::Additive,
            4 => BlendMode::Overlay,
            5 => BlendMode::Lighten,
            6 => BlendMode::Darken,
            7 => BlendMode::Difference,
            _ => BlendMode::Normal,
        }
    }
}

/// Blend `top` over `base` with the given mode and layer opacity.
///
/// Fast paths cover the two dominant cases (fully transparent top, opaque
/// Normal overwrite) so the per-pixel cost in the compositor stays low.
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode, opacity: f32) -> Rgba<u8> {
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }
    if matches!(mode, BlendMode::Normal) && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);

    let base_r = base[0] as f32 / 255.0;
    let base_g = base[1] as f32 / 255.0;
    let base_b = base[2] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;

    let top_r = top[0] as f32 / 255.0;
    let top_g = top[1] as f32 / 255.0;
    let top_b = top[2] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity;

    let (r, g, b) = match mode {
        BlendMode::Normal => (top_r, top_g, top_b),
        BlendMode::Multiply => (base_r * top_r, base_g * top_g, base_b * top_b),
        BlendMode::Screen => (
            1.0 - (1.0 - base_r) * (1.0 - top_r),
            1.0 - (1.0 - base_g) * (1.0 - top_g),
            1.0 - (1.0 - base_b) * (1.0 - top_b),
        ),
        BlendMode::Additive => (
            (base_r + top_r).min(1.0),
            (base_g + top_g).min(1.0),
            (base_b + top_b).min(1.0),
        ),
        BlendMode::Overlay => (
            overlay_channel(base_r, top_r),
            overlay_channel(base_g, top_g),
            overlay_channel(base_b, top_b),
        ),
        BlendMode::Lighten => (base_r.max(top_r), base_g.max(top_g), base_b.max(top_b)),
        BlendMode::Darken => (base_r.min(top_r), base_g.min(top_g), base_b.min(top_b)),
        BlendMode::Difference => (
            (base_r - top_r).abs(),
            (base_g - top_g).abs(),
            (base_b - top_b).abs(),
        ),
    };

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a == 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    Rgba([
        (out_r * 255.0).clamp(0.0, 255.0) as u8,
        (out_g * 255.0).clamp(0.0, 255.0) as u8,
        (out_b * 255.0).clamp(0.0, 255.0) as u8,
        (out_a * 255.0).clamp(0.0, 255.0) as u8,
    ])
}

fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

// ============================================================================
// LAYERS
// ============================================================================

/// Unique, stable identity of a layer within a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId(Uuid);

impl LayerId {
    pub fn new() -> Self {
        LayerId(Uuid::new_v4())
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One positioned, transformable raster image within a document.
///
/// Pixel data is immutable once assigned (`Arc`-shared): transforms only ever
/// change the affine components, never resample in place. Replacing the
/// raster means removing the layer and adding a new one.
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub pixels: Arc<RgbaImage>,
    pub transform: Affine,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub visible: bool,
    /// Optional grayscale mask, same dimensions as `pixels`.
    pub mask: Option<Arc<GrayImage>>,
}

impl Layer {
    pub fn new(name: impl Into<String>, pixels: RgbaImage) -> Self {
        Self {
            id: LayerId::new(),
            name: name.into(),
            pixels: Arc::new(pixels),
            transform: Affine::IDENTITY,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            visible: true,
            mask: None,
        }
    }

    /// Raster width — immutable after creation.
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    /// Raster height — immutable after creation.
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Canvas-space bounding box under the current transform.
    pub fn bounds(&self) -> Rect {
        self.transform.bounding_box(self.width(), self.height())
    }
}

/// Flat serializable form of a layer, used by history entries and the `.lfd`
/// document snapshot. Pixel bytes are row-major RGBA.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerData {
    pub id: LayerId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub transform: Affine,
    pub opacity: f32,
    pub blend_mode: u8,
    pub visible: bool,
    pub mask: Option<Vec<u8>>,
}

impl LayerData {
    pub fn from_layer(layer: &Layer) -> Self {
        Self {
            id: layer.id,
            name: layer.name.clone(),
            width: layer.width(),
            height: layer.height(),
            pixels: layer.pixels.as_raw().clone(),
            transform: layer.transform,
            opacity: layer.opacity,
            blend_mode: layer.blend_mode.to_u8(),
            visible: layer.visible,
            mask: layer.mask.as_ref().map(|m| m.as_raw().clone()),
        }
    }

    /// Rebuild the live layer. Fails only when the byte counts do not match
    /// the recorded dimensions (corrupt entry).
    pub fn into_layer(&self) -> Option<Layer> {
        let pixels = RgbaImage::from_raw(self.width, self.height, self.pixels.clone())?;
        let mask = match &self.mask {
            Some(bytes) => {
                Some(Arc::new(GrayImage::from_raw(self.width, self.height, bytes.clone())?))
            }
            None => None,
        };
        Some(Layer {
            id: self.id,
            name: self.name.clone(),
            pixels: Arc::new(pixels),
            transform: self.transform,
            opacity: self.opacity,
            blend_mode: BlendMode::from_u8(self.blend_mode),
            visible: self.visible,
            mask,
        })
    }
}

// ============================================================================
// MASK PATCH — pre/post image of a painted mask region
// ============================================================================

/// Rectangular patch of document-mask pixels, self-contained for undo/redo.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskPatch {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl MaskPatch {
    /// Capture the region `rect` of `mask`, clamped to `(w, h)`.
    pub fn capture(mask: Option<&GrayImage>, rect: Rect, w: u32, h: u32) -> Self {
        let min_x = (rect.min_x.floor().max(0.0) as u32).min(w);
        let min_y = (rect.min_y.floor().max(0.0) as u32).min(h);
        let max_x = (rect.max_x.ceil().max(0.0) as u32).min(w);
        let max_y = (rect.max_y.ceil().max(0.0) as u32).min(h);
        let pw = max_x.saturating_sub(min_x);
        let ph = max_y.saturating_sub(min_y);

        let mut pixels = Vec::with_capacity((pw * ph) as usize);
        for y in min_y..max_y {
            for x in min_x..max_x {
                // Unpainted mask reads as fully opaque.
                let v = mask.map(|m| m.get_pixel(x, y)[0]).unwrap_or(255);
                pixels.push(v);
            }
        }
        Self { x: min_x, y: min_y, width: pw, height: ph, pixels }
    }

    /// Write the patch back into `mask`.
    pub fn apply(&self, mask: &mut GrayImage) {
        let mut idx = 0;
        for y in 0..self.height {
            for x in 0..self.width {
                let cx = self.x + x;
                let cy = self.y + y;
                if cx < mask.width() && cy < mask.height() && idx < self.pixels.len() {
                    mask.put_pixel(cx, cy, image::Luma([self.pixels[idx]]));
                }
                idx += 1;
            }
        }
    }
}

// ============================================================================
// STORE ERRORS
// ============================================================================

/// Typed failures of Layer Store mutators. Interactive callers handle these
/// synchronously (reject the gesture); they never cross a process boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreError {
    NotFound(LayerId),
    BadIndex(usize),
    InvalidOpacity(f32),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "No layer with id {}", id),
            StoreError::BadIndex(i) => write!(f, "Layer index {} out of bounds", i),
            StoreError::InvalidOpacity(v) => write!(f, "Opacity {} is not a finite value", v),
        }
    }
}

impl std::error::Error for StoreError {}

// ============================================================================
// DOCUMENT — the layer store
// ============================================================================

/// One editing session's full layered canvas state.
///
/// Layers are ordered bottom-to-top. All mutation goes through the typed
/// mutators below, each of which validates its target, captures a
/// self-contained [`HistoryEntry`] *before* applying, and bumps the dirty
/// generation for compositing-cache invalidation.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub layers: Vec<Layer>,
    /// Document-wide grayscale mask. `None` means nothing painted yet, which
    /// composites as fully opaque.
    pub mask: Option<GrayImage>,
    /// Bumped on every mutation; preview caches key off this.
    pub dirty_generation: u64,
}

impl PartialEq for Document {
    /// Structural equality of the document content. The dirty generation is
    /// bookkeeping, not content, so it is excluded; undo/redo round trips
    /// must compare equal even though they bump the counter. A materialized
    /// all-opaque mask means the same thing as no mask, so the two compare
    /// equal as well.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.width == other.width
            && self.height == other.height
            && self.layers == other.layers
            && masks_equivalent(&self.mask, &other.mask)
    }
}

fn masks_equivalent(a: &Option<GrayImage>, b: &Option<GrayImage>) -> bool {
    let opaque = |m: &GrayImage| m.pixels().all(|p| p[0] == u8::MAX);
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        (Some(m), None) | (None, Some(m)) => opaque(m),
    }
}

impl Document {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            layers: Vec::new(),
            mask: None,
            dirty_generation: 0,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty_generation += 1;
    }

    pub fn index_of(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    fn require_index(&self, id: LayerId) -> Result<usize, StoreError> {
        self.index_of(id).ok_or(StoreError::NotFound(id))
    }

    // ---- mutators ----------------------------------------------------------
    //
    // Each returns the HistoryEntry describing the mutation (forward and
    // inverse deltas included) so the caller can record it. The entry is
    // built from the pre-image BEFORE the document changes.

    /// Insert a new layer at `position` (clamped to the top when `None` or
    /// past the end). Returns the new layer's id alongside the entry.
    pub fn add_layer(
        &mut self,
        pixels: RgbaImage,
        position: Option<usize>,
    ) -> (LayerId, HistoryEntry) {
        let index = position.unwrap_or(self.layers.len()).min(self.layers.len());
        let layer = Layer::new(format!("Layer {}", self.layers.len() + 1), pixels);
        let id = layer.id;
        let entry = HistoryEntry::AddLayer {
            index,
            layer: LayerData::from_layer(&layer),
        };
        self.layers.insert(index, layer);
        self.mark_dirty();
        (id, entry)
    }

    /// Insert a fully-built layer (used by paste / duplicate paths that set
    /// their own transform before insertion).
    pub fn add_layer_prepared(&mut self, layer: Layer, position: Option<usize>) -> HistoryEntry {
        let index = position.unwrap_or(self.layers.len()).min(self.layers.len());
        let entry = HistoryEntry::AddLayer {
            index,
            layer: LayerData::from_layer(&layer),
        };
        self.layers.insert(index, layer);
        self.mark_dirty();
        entry
    }

    pub fn remove_layer(&mut self, id: LayerId) -> Result<HistoryEntry, StoreError> {
        let index = self.require_index(id)?;
        let layer = self.layers.remove(index);
        self.mark_dirty();
        Ok(HistoryEntry::RemoveLayer {
            index,
            layer: LayerData::from_layer(&layer),
        })
    }

    pub fn reorder(&mut self, id: LayerId, new_index: usize) -> Result<HistoryEntry, StoreError> {
        let from = self.require_index(id)?;
        if new_index >= self.layers.len() {
            return Err(StoreError::BadIndex(new_index));
        }
        let layer = self.layers.remove(from);
        self.layers.insert(new_index, layer);
        self.mark_dirty();
        Ok(HistoryEntry::Reorder { id, from, to: new_index })
    }

    pub fn set_transform(&mut self, id: LayerId, affine: Affine) -> Result<HistoryEntry, StoreError> {
        let index = self.require_index(id)?;
        let before = self.layers[index].transform;
        self.layers[index].transform = affine;
        self.mark_dirty();
        Ok(HistoryEntry::SetTransform { id, before, after: affine })
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f32) -> Result<HistoryEntry, StoreError> {
        if !opacity.is_finite() {
            return Err(StoreError::InvalidOpacity(opacity));
        }
        let opacity = opacity.clamp(0.0, 1.0);
        let index = self.require_index(id)?;
        let before = self.layers[index].opacity;
        self.layers[index].opacity = opacity;
        self.mark_dirty();
        Ok(HistoryEntry::SetOpacity { id, before, after: opacity })
    }

    pub fn set_blend_mode(&mut self, id: LayerId, mode: BlendMode) -> Result<HistoryEntry, StoreError> {
        let index = self.require_index(id)?;
        let before = self.layers[index].blend_mode;
        self.layers[index].blend_mode = mode;
        self.mark_dirty();
        Ok(HistoryEntry::SetBlendMode { id, before, after: mode })
    }

    pub fn set_visibility(&mut self, id: LayerId, visible: bool) -> Result<HistoryEntry, StoreError> {
        let index = self.require_index(id)?;
        let before = self.layers[index].visible;
        self.layers[index].visible = visible;
        self.mark_dirty();
        Ok(HistoryEntry::SetVisibility { id, before, after: visible })
    }

    /// Attach or clear a per-layer mask. The mask raster must match the
    /// layer's dimensions; mismatches are a caller bug reported as BadIndex
    /// on the pixel count.
    pub fn set_mask(&mut self, id: LayerId, mask: Option<GrayImage>) -> Result<HistoryEntry, StoreError> {
        let index = self.require_index(id)?;
        if let Some(m) = &mask {
            let layer = &self.layers[index];
            if m.width() != layer.width() || m.height() != layer.height() {
                return Err(StoreError::BadIndex(m.len()));
            }
        }
        let before = self.layers[index].mask.as_ref().map(|m| m.as_raw().clone());
        let after = mask.as_ref().map(|m| m.as_raw().clone());
        self.layers[index].mask = mask.map(Arc::new);
        self.mark_dirty();
        Ok(HistoryEntry::SetLayerMask { id, before, after })
    }

    /// Paint one brush stroke into the document-wide mask: circular stamps of
    /// `value` with the given radius along the polyline `points` (canvas
    /// coordinates). Returns the entry holding before/after patches of the
    /// touched region.
    pub fn paint_mask_stroke(
        &mut self,
        points: &[(f32, f32)],
        radius: f32,
        value: u8,
    ) -> Option<HistoryEntry> {
        if points.is_empty() || radius <= 0.0 {
            return None;
        }

        // Bounding rect of the whole stroke.
        let mut rect = Rect::from_corners(points[0], points[0]);
        for &p in &points[1..] {
            rect = rect.union(&Rect::from_corners(p, p));
        }
        rect.min_x -= radius;
        rect.min_y -= radius;
        rect.max_x += radius;
        rect.max_y += radius;

        let before = MaskPatch::capture(self.mask.as_ref(), rect, self.width, self.height);

        // First stroke materialises the mask as fully opaque.
        let mask = self
            .mask
            .get_or_insert_with(|| GrayImage::from_pixel(self.width, self.height, image::Luma([255])));

        for &(px, py) in points {
            stamp_circle(mask, px, py, radius, value);
        }

        let after = MaskPatch::capture(self.mask.as_ref(), rect, self.width, self.height);
        self.mark_dirty();
        Some(HistoryEntry::PaintMask { before, after })
    }

    // ---- low-level appliers (history replay) -------------------------------
    //
    // Used by HistoryManager when applying forward/inverse deltas; these do
    // NOT emit entries. They bump the dirty generation so previews refresh.

    pub(crate) fn apply_insert(&mut self, index: usize, layer: Layer) {
        let index = index.min(self.layers.len());
        self.layers.insert(index, layer);
        self.mark_dirty();
    }

    pub(crate) fn apply_remove(&mut self, index: usize) -> Option<Layer> {
        if index >= self.layers.len() {
            return None;
        }
        let layer = self.layers.remove(index);
        self.mark_dirty();
        Some(layer)
    }

    pub(crate) fn apply_move(&mut self, from: usize, to: usize) -> bool {
        if from >= self.layers.len() || to >= self.layers.len() {
            return false;
        }
        let layer = self.layers.remove(from);
        self.layers.insert(to, layer);
        self.mark_dirty();
        true
    }

    pub(crate) fn apply_mask_patch(&mut self, patch: &MaskPatch) {
        let mask = self
            .mask
            .get_or_insert_with(|| GrayImage::from_pixel(self.width, self.height, image::Luma([255])));
        patch.apply(mask);
        self.mark_dirty();
    }
}

/// Stamp a filled circle of `value` into a grayscale mask.
fn stamp_circle(mask: &mut GrayImage, cx: f32, cy: f32, radius: f32, value: u8) {
    let min_x = ((cx - radius).floor().max(0.0)) as u32;
    let min_y = ((cy - radius).floor().max(0.0)) as u32;
    let max_x = ((cx + radius).ceil().max(0.0) as u32).min(mask.width());
    let max_y = ((cy + radius).ceil().max(0.0) as u32).min(mask.height());
    let r2 = radius * radius;
    for y in min_y..max_y {
        for x in min_x..max_x {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            if dx * dx + dy * dy <= r2 {
                mask.put_pixel(x, y, image::Luma([value]));
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(px))
    }

    #[test]
    fn affine_roundtrip_is_exact_for_identity() {
        let a = Affine::IDENTITY;
        let (x, y) = a.invert(12.5, -3.0);
        assert_eq!((x, y), (12.5, -3.0));
    }

    #[test]
    fn affine_apply_then_invert_recovers_point() {
        let a = Affine { tx: 40.0, ty: -8.0, scale_x: 2.0, scale_y: 0.5, rotation: 0.7 };
        let (cx, cy) = a.apply(13.0, 29.0);
        let (lx, ly) = a.invert(cx, cy);
        assert!((lx - 13.0).abs() < 1e-4);
        assert!((ly - 29.0).abs() < 1e-4);
    }

    #[test]
    fn bounding_box_of_translated_layer() {
        let a = Affine::translation(10.0, 20.0);
        let r = a.bounding_box(100, 50);
        assert_eq!(r.min_x, 10.0);
        assert_eq!(r.min_y, 20.0);
        assert_eq!(r.max_x, 110.0);
        assert_eq!(r.max_y, 70.0);
    }

    #[test]
    fn mutators_reject_unknown_ids() {
        let mut doc = Document::new("t", 64, 64);
        let ghost = LayerId::new();
        assert_eq!(doc.remove_layer(ghost), Err(StoreError::NotFound(ghost)));
        assert_eq!(doc.set_opacity(ghost, 0.5), Err(StoreError::NotFound(ghost)));
        assert_eq!(
            doc.set_transform(ghost, Affine::IDENTITY),
            Err(StoreError::NotFound(ghost))
        );
    }

    #[test]
    fn opacity_rejects_nan_and_clamps_range() {
        let mut doc = Document::new("t", 8, 8);
        let (id, _) = doc.add_layer(solid(8, 8, [255, 0, 0, 255]), None);
        assert!(matches!(
            doc.set_opacity(id, f32::NAN),
            Err(StoreError::InvalidOpacity(_))
        ));
        doc.set_opacity(id, 3.0).unwrap();
        assert_eq!(doc.layer(id).unwrap().opacity, 1.0);
    }

    #[test]
    fn reorder_validates_target_index() {
        let mut doc = Document::new("t", 8, 8);
        let (id, _) = doc.add_layer(solid(8, 8, [1, 2, 3, 4]), None);
        assert_eq!(doc.reorder(id, 5), Err(StoreError::BadIndex(5)));
    }

    #[test]
    fn mask_stroke_creates_mask_and_patch_pair() {
        let mut doc = Document::new("t", 32, 32);
        let entry = doc
            .paint_mask_stroke(&[(16.0, 16.0)], 4.0, 0)
            .expect("stroke produces an entry");
        let mask = doc.mask.as_ref().unwrap();
        assert_eq!(mask.get_pixel(16, 16)[0], 0);
        assert_eq!(mask.get_pixel(0, 0)[0], 255);
        match entry {
            HistoryEntry::PaintMask { before, after } => {
                assert_eq!(before.width, after.width);
                assert!(before.pixels.iter().all(|&v| v == 255));
            }
            other => panic!("unexpected entry {:?}", other.description()),
        }
    }

    #[test]
    fn every_mutation_bumps_dirty_generation() {
        let mut doc = Document::new("t", 8, 8);
        let g0 = doc.dirty_generation;
        let (id, _) = doc.add_layer(solid(8, 8, [0, 0, 0, 255]), None);
        assert!(doc.dirty_generation > g0);
        let g1 = doc.dirty_generation;
        doc.set_visibility(id, false).unwrap();
        assert!(doc.dirty_generation > g1);
    }
}
