use image::RgbaImage;

use crate::canvas::{Affine, Document, Layer, LayerId, Rect, StoreError};
use crate::history::{HistoryEntry, HistoryManager};
use crate::log_debug;

/// Handle hotspot radius in SCREEN pixels. Converted to canvas units by the
/// current zoom so handles stay grabbable at any magnification.
const HANDLE_HIT_RADIUS: f32 = 8.0;

/// Vertical screen-space offset of the rotate handle above the top edge.
const ROTATE_HANDLE_OFFSET: f32 = 24.0;

const MIN_GESTURE_SCALE: f32 = 0.01;
const MIN_ZOOM: f32 = 0.05;
const MAX_ZOOM: f32 = 32.0;

// ============================================================================
// VIEWPORT — screen ↔ canvas conversion
// ============================================================================

/// Pan/zoom state of the interactive surface. Conversions are exact and
/// invertible: `screen = canvas * zoom + pan`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub pan_x: f32,
    pub pan_y: f32,
    pub zoom: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { pan_x: 0.0, pan_y: 0.0, zoom: 1.0 }
    }
}

impl Viewport {
    pub fn screen_to_canvas(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pan_x) / self.zoom, (y - self.pan_y) / self.zoom)
    }

    pub fn canvas_to_screen(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.zoom + self.pan_x, y * self.zoom + self.pan_y)
    }

    /// Zoom about a screen point, keeping the canvas point under the cursor
    /// fixed in place.
    pub fn zoom_about(&mut self, screen_x: f32, screen_y: f32, factor: f32) {
        let (cx, cy) = self.screen_to_canvas(screen_x, screen_y);
        self.zoom = (self.zoom * factor).clamp(MIN_ZOOM, MAX_ZOOM);
        self.pan_x = screen_x - cx * self.zoom;
        self.pan_y = screen_y - cy * self.zoom;
    }
}

// ============================================================================
// SELECTION — transient, never part of undo history
// ============================================================================

/// Currently-selected layer ids plus their combined canvas-space bounding
/// box. Recomputed on every store or selection change; never recorded in
/// history.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub ids: Vec<LayerId>,
    pub bounds: Option<Rect>,
}

impl Selection {
    pub fn clear(&mut self) {
        self.ids.clear();
        self.bounds = None;
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.ids.contains(&id)
    }

    pub fn set(&mut self, ids: Vec<LayerId>, doc: &Document) {
        self.ids = ids;
        self.recompute(doc);
    }

    pub fn toggle(&mut self, id: LayerId, doc: &Document) {
        if let Some(pos) = self.ids.iter().position(|&i| i == id) {
            self.ids.remove(pos);
        } else {
            self.ids.push(id);
        }
        self.recompute(doc);
    }

    /// Drop ids that no longer resolve and rebuild the combined bounds.
    pub fn recompute(&mut self, doc: &Document) {
        self.ids.retain(|&id| doc.index_of(id).is_some());
        self.bounds = self
            .ids
            .iter()
            .filter_map(|&id| doc.layer(id).map(Layer::bounds))
            .reduce(|a, b| a.union(&b));
    }
}

// ============================================================================
// POINTER EVENTS & HIT-TESTING
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Modifiers {
    /// Preserves aspect ratio while resizing; extends the selection on click.
    pub shift: bool,
}

/// Raw pointer gestures in SCREEN coordinates, as delivered by the host UI.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PointerEvent {
    Press { x: f32, y: f32, mods: Modifiers },
    Drag { x: f32, y: f32, mods: Modifiers },
    Release { x: f32, y: f32, mods: Modifiers },
    Wheel { x: f32, y: f32, delta: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handle {
    TopLeft,
    Top,
    TopRight,
    Right,
    BottomRight,
    Bottom,
    BottomLeft,
    Left,
    Rotate,
}

impl Handle {
    fn affects_x(&self) -> bool {
        !matches!(self, Handle::Top | Handle::Bottom | Handle::Rotate)
    }

    fn affects_y(&self) -> bool {
        !matches!(self, Handle::Left | Handle::Right | Handle::Rotate)
    }

    /// Canvas position of this handle on the given selection bounds.
    fn position(&self, b: &Rect, zoom: f32) -> (f32, f32) {
        let (cx, cy) = b.center();
        match self {
            Handle::TopLeft => (b.min_x, b.min_y),
            Handle::Top => (cx, b.min_y),
            Handle::TopRight => (b.max_x, b.min_y),
            Handle::Right => (b.max_x, cy),
            Handle::BottomRight => (b.max_x, b.max_y),
            Handle::Bottom => (cx, b.max_y),
            Handle::BottomLeft => (b.min_x, b.max_y),
            Handle::Left => (b.min_x, cy),
            Handle::Rotate => (cx, b.min_y - ROTATE_HANDLE_OFFSET / zoom),
        }
    }

    /// The fixed point a resize scales about — the opposite corner or edge.
    fn anchor(&self, b: &Rect) -> (f32, f32) {
        let (cx, cy) = b.center();
        match self {
            Handle::TopLeft => (b.max_x, b.max_y),
            Handle::Top => (cx, b.max_y),
            Handle::TopRight => (b.min_x, b.max_y),
            Handle::Right => (b.min_x, cy),
            Handle::BottomRight => (b.min_x, b.min_y),
            Handle::Bottom => (cx, b.min_y),
            Handle::BottomLeft => (b.max_x, b.min_y),
            Handle::Left => (b.max_x, cy),
            Handle::Rotate => (cx, cy),
        }
    }

    fn all() -> &'static [Handle] {
        &[
            Handle::TopLeft,
            Handle::Top,
            Handle::TopRight,
            Handle::Right,
            Handle::BottomRight,
            Handle::Bottom,
            Handle::BottomLeft,
            Handle::Left,
            Handle::Rotate,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HitResult {
    /// A manipulation handle of the current selection. Takes priority over
    /// any layer body underneath it.
    Handle(Handle),
    Layer(LayerId),
    Empty,
}

/// Hit-test a canvas-space point against the selection's handles, then the
/// layer stack. Tie-break: the topmost layer (highest z-order) whose
/// transformed bounding box contains the point wins.
pub fn hit_test(doc: &Document, selection: &Selection, viewport: &Viewport, x: f32, y: f32) -> HitResult {
    if let Some(bounds) = &selection.bounds {
        let radius = HANDLE_HIT_RADIUS / viewport.zoom;
        for &handle in Handle::all() {
            let (hx, hy) = handle.position(bounds, viewport.zoom);
            let dx = x - hx;
            let dy = y - hy;
            if dx * dx + dy * dy <= radius * radius {
                return HitResult::Handle(handle);
            }
        }
    }

    for layer in doc.layers.iter().rev() {
        if !layer.visible {
            continue;
        }
        if layer.bounds().contains(x, y) {
            return HitResult::Layer(layer.id);
        }
    }
    HitResult::Empty
}

// ============================================================================
// TOOLS & GESTURE STATE MACHINE
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Tool {
    Select,
    /// Paints into the document-wide mask. `value` 0 masks out, 255 restores.
    MaskBrush { radius: f32, value: u8 },
}

impl Default for Tool {
    fn default() -> Self {
        Tool::Select
    }
}

/// Interactive gesture state. Transitions are driven by
/// (current state, pointer event, hit-test result).
#[derive(Clone, Debug, PartialEq)]
pub enum ToolState {
    Idle,
    /// Marquee drag producing a rectangle selection.
    Selecting { origin: (f32, f32), current: (f32, f32) },
    /// Moving the selected layers. Working copies of the original affines;
    /// committed as one entry on release.
    Dragging { start: (f32, f32), originals: Vec<(LayerId, Affine)> },
    Resizing {
        handle: Handle,
        start: (f32, f32),
        anchor: (f32, f32),
        originals: Vec<(LayerId, Affine)>,
    },
    Rotating {
        center: (f32, f32),
        start_angle: f32,
        originals: Vec<(LayerId, Affine)>,
    },
    /// Mask brush stroke in progress; points accumulate and commit on
    /// release as a single undo step.
    Painting { points: Vec<(f32, f32)> },
}

impl Default for ToolState {
    fn default() -> Self {
        ToolState::Idle
    }
}

// ============================================================================
// EDITOR SESSION — glue between gestures, the store, and history
// ============================================================================

/// One interactive editing session: the document, its undo history, the
/// selection, the viewport, and the in-flight gesture.
pub struct EditorSession {
    pub document: Document,
    pub history: HistoryManager,
    pub selection: Selection,
    pub viewport: Viewport,
    pub tool: Tool,
    pub state: ToolState,
    /// When true, freshly added layers are scaled to fit the canvas.
    pub fit_on_add: bool,
}

impl EditorSession {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            history: HistoryManager::default(),
            selection: Selection::default(),
            viewport: Viewport::default(),
            tool: Tool::default(),
            state: ToolState::Idle,
            fit_on_add: false,
        }
    }

    // ---- store wrappers (record history, refresh selection) ---------------

    /// Add an image as a new top layer, honouring `fit_on_add`: oversized
    /// images are uniformly scaled down and centered on the canvas.
    pub fn add_image(&mut self, pixels: RgbaImage) -> LayerId {
        let (w, h) = (pixels.width(), pixels.height());
        let mut layer = Layer::new(format!("Layer {}", self.document.layers.len() + 1), pixels);

        if self.fit_on_add && w > 0 && h > 0 {
            let scale = (self.document.width as f32 / w as f32)
                .min(self.document.height as f32 / h as f32)
                .min(1.0);
            layer.transform = Affine {
                tx: (self.document.width as f32 - w as f32 * scale) * 0.5,
                ty: (self.document.height as f32 - h as f32 * scale) * 0.5,
                scale_x: scale,
                scale_y: scale,
                rotation: 0.0,
            };
        }

        let id = layer.id;
        let entry = self.document.add_layer_prepared(layer, None);
        self.history.record(entry);
        self.selection.set(vec![id], &self.document);
        id
    }

    pub fn remove_layer(&mut self, id: LayerId) -> Result<(), StoreError> {
        let entry = self.document.remove_layer(id)?;
        self.history.record(entry);
        self.selection.recompute(&self.document);
        Ok(())
    }

    pub fn reorder(&mut self, id: LayerId, new_index: usize) -> Result<(), StoreError> {
        let entry = self.document.reorder(id, new_index)?;
        self.history.record(entry);
        self.selection.recompute(&self.document);
        Ok(())
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f32) -> Result<(), StoreError> {
        let entry = self.document.set_opacity(id, opacity)?;
        self.history.record(entry);
        Ok(())
    }

    pub fn set_blend_mode(&mut self, id: LayerId, mode: crate::canvas::BlendMode) -> Result<(), StoreError> {
        let entry = self.document.set_blend_mode(id, mode)?;
        self.history.record(entry);
        Ok(())
    }

    pub fn set_visibility(&mut self, id: LayerId, visible: bool) -> Result<(), StoreError> {
        let entry = self.document.set_visibility(id, visible)?;
        self.history.record(entry);
        self.selection.recompute(&self.document);
        Ok(())
    }

    pub fn set_layer_mask(&mut self, id: LayerId, mask: Option<image::GrayImage>) -> Result<(), StoreError> {
        let entry = self.document.set_mask(id, mask)?;
        self.history.record(entry);
        Ok(())
    }

    pub fn undo(&mut self) -> Option<String> {
        let desc = self.history.undo(&mut self.document);
        self.selection.recompute(&self.document);
        desc
    }

    pub fn redo(&mut self) -> Option<String> {
        let desc = self.history.redo(&mut self.document);
        self.selection.recompute(&self.document);
        desc
    }

    // ---- gesture state machine ---------------------------------------------

    pub fn handle_pointer(&mut self, event: PointerEvent) {
        match event {
            PointerEvent::Press { x, y, mods } => self.on_press(x, y, mods),
            PointerEvent::Drag { x, y, mods } => self.on_drag(x, y, mods),
            PointerEvent::Release { x, y, mods } => self.on_release(x, y, mods),
            PointerEvent::Wheel { x, y, delta } => {
                let factor = if delta > 0.0 { 1.1 } else { 1.0 / 1.1 };
                self.viewport.zoom_about(x, y, factor);
            }
        }
    }

    fn on_press(&mut self, sx: f32, sy: f32, mods: Modifiers) {
        let (x, y) = self.viewport.screen_to_canvas(sx, sy);

        if let Tool::MaskBrush { .. } = self.tool {
            self.state = ToolState::Painting { points: vec![(x, y)] };
            return;
        }

        // hit_test only reports handles when a selection with bounds exists.
        let hit = hit_test(&self.document, &self.selection, &self.viewport, x, y);
        match (hit, self.selection.bounds) {
            (HitResult::Handle(Handle::Rotate), Some(bounds)) => {
                let center = bounds.center();
                self.state = ToolState::Rotating {
                    center,
                    start_angle: (y - center.1).atan2(x - center.0),
                    originals: self.selected_transforms(),
                };
            }
            (HitResult::Handle(handle), Some(bounds)) => {
                self.state = ToolState::Resizing {
                    handle,
                    start: (x, y),
                    anchor: handle.anchor(&bounds),
                    originals: self.selected_transforms(),
                };
            }
            (HitResult::Handle(_), None) => {}
            (HitResult::Layer(id), _) => {
                if mods.shift {
                    self.selection.toggle(id, &self.document);
                } else if !self.selection.contains(id) {
                    self.selection.set(vec![id], &self.document);
                }
                self.state = ToolState::Dragging {
                    start: (x, y),
                    originals: self.selected_transforms(),
                };
            }
            (HitResult::Empty, _) => {
                if !mods.shift {
                    self.selection.clear();
                }
                self.state = ToolState::Selecting { origin: (x, y), current: (x, y) };
            }
        }
    }

    fn on_drag(&mut self, sx: f32, sy: f32, mods: Modifiers) {
        let (x, y) = self.viewport.screen_to_canvas(sx, sy);

        match &mut self.state {
            ToolState::Idle => {}
            ToolState::Selecting { current, .. } => *current = (x, y),
            ToolState::Painting { points } => points.push((x, y)),
            ToolState::Dragging { start, originals } => {
                let dx = x - start.0;
                let dy = y - start.1;
                let updates: Vec<(LayerId, Affine)> = originals
                    .iter()
                    .map(|&(id, orig)| {
                        (id, Affine { tx: orig.tx + dx, ty: orig.ty + dy, ..orig })
                    })
                    .collect();
                self.apply_working_transforms(&updates);
            }
            ToolState::Resizing { handle, start, anchor, originals } => {
                let (sx_f, sy_f) = resize_factors(*handle, *start, *anchor, (x, y), mods.shift);
                let (ax, ay) = *anchor;
                let updates: Vec<(LayerId, Affine)> = originals
                    .iter()
                    .map(|&(id, orig)| {
                        (
                            id,
                            Affine {
                                tx: ax + (orig.tx - ax) * sx_f,
                                ty: ay + (orig.ty - ay) * sy_f,
                                scale_x: orig.scale_x * sx_f,
                                scale_y: orig.scale_y * sy_f,
                                rotation: orig.rotation,
                            },
                        )
                    })
                    .collect();
                self.apply_working_transforms(&updates);
            }
            ToolState::Rotating { center, start_angle, originals } => {
                let angle = (y - center.1).atan2(x - center.0);
                let delta = angle - *start_angle;
                let (sin, cos) = delta.sin_cos();
                let (cx, cy) = *center;
                let updates: Vec<(LayerId, Affine)> = originals
                    .iter()
                    .map(|&(id, orig)| {
                        let dx = orig.tx - cx;
                        let dy = orig.ty - cy;
                        (
                            id,
                            Affine {
                                tx: cx + dx * cos - dy * sin,
                                ty: cy + dx * sin + dy * cos,
                                rotation: orig.rotation + delta,
                                ..orig
                            },
                        )
                    })
                    .collect();
                self.apply_working_transforms(&updates);
            }
        }
    }

    fn on_release(&mut self, sx: f32, sy: f32, _mods: Modifiers) {
        let (x, y) = self.viewport.screen_to_canvas(sx, sy);
        let state = std::mem::take(&mut self.state);

        match state {
            ToolState::Idle => {}
            ToolState::Selecting { origin, .. } => {
                let rect = Rect::from_corners(origin, (x, y));
                let hits: Vec<LayerId> = self
                    .document
                    .layers
                    .iter()
                    .filter(|l| l.visible && l.bounds().intersects(&rect))
                    .map(|l| l.id)
                    .collect();
                self.selection.set(hits, &self.document);
            }
            ToolState::Dragging { originals, .. }
            | ToolState::Resizing { originals, .. }
            | ToolState::Rotating { originals, .. } => {
                self.commit_transform_gesture(originals);
            }
            ToolState::Painting { mut points } => {
                points.push((x, y));
                if let Tool::MaskBrush { radius, value } = self.tool
                    && let Some(entry) = self.document.paint_mask_stroke(&points, radius, value)
                {
                    self.history.record(entry);
                }
            }
        }
    }

    fn selected_transforms(&self) -> Vec<(LayerId, Affine)> {
        self.selection
            .ids
            .iter()
            .filter_map(|&id| self.document.layer(id).map(|l| (id, l.transform)))
            .collect()
    }

    /// Live-update transforms during a gesture. Bypasses the mutators so no
    /// intermediate entries pollute the undo history.
    fn apply_working_transforms(&mut self, updates: &[(LayerId, Affine)]) {
        for &(id, affine) in updates {
            if let Some(index) = self.document.index_of(id) {
                self.document.layers[index].transform = affine;
            }
        }
        self.document.mark_dirty();
        self.selection.recompute(&self.document);
    }

    /// One gesture = one undo step: collect the per-layer before/after pairs
    /// into a single (possibly grouped) entry.
    fn commit_transform_gesture(&mut self, originals: Vec<(LayerId, Affine)>) {
        let mut entries = Vec::new();
        for (id, before) in originals {
            if let Some(layer) = self.document.layer(id)
                && layer.transform != before
            {
                entries.push(HistoryEntry::SetTransform { id, before, after: layer.transform });
            }
        }

        match entries.len() {
            0 => log_debug!("Gesture released with no transform change"),
            1 => {
                if let Some(entry) = entries.pop() {
                    self.history.record(entry);
                }
            }
            _ => self.history.record(HistoryEntry::Group {
                name: "Transform Layers".to_string(),
                entries,
            }),
        }
        self.selection.recompute(&self.document);
    }
}

fn resize_factors(
    handle: Handle,
    start: (f32, f32),
    anchor: (f32, f32),
    current: (f32, f32),
    preserve_aspect: bool,
) -> (f32, f32) {
    let axis_factor = |cur: f32, st: f32, anc: f32| -> f32 {
        let denom = st - anc;
        if denom.abs() < f32::EPSILON {
            1.0
        } else {
            ((cur - anc) / denom).max(MIN_GESTURE_SCALE)
        }
    };

    let mut sx = if handle.affects_x() { axis_factor(current.0, start.0, anchor.0) } else { 1.0 };
    let mut sy = if handle.affects_y() { axis_factor(current.1, start.1, anchor.1) } else { 1.0 };

    if preserve_aspect {
        let f = if handle.affects_x() && handle.affects_y() {
            // Corner drag: follow the axis that moved furthest.
            if (sx - 1.0).abs() >= (sy - 1.0).abs() { sx } else { sy }
        } else if handle.affects_x() {
            sx
        } else {
            sy
        };
        sx = f;
        sy = f;
    }
    (sx, sy)
}

// ============================================================================
// TESTS
// ============================================================================
