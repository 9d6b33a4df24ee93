use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::canvas::{Affine, BlendMode, Document, LayerData, LayerId, MaskPatch};
use crate::log_err;

// ============================================================================
// HISTORY ENTRIES — one atomic document mutation each
// ============================================================================

/// Immutable, serializable description of one atomic document mutation.
///
/// Every entry is self-contained: it stores both the forward and the inverse
/// delta, never a diff against a neighbouring entry. That makes it safe to
/// drop the oldest entries under memory pressure — the remaining stack still
/// replays without them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HistoryEntry {
    AddLayer {
        index: usize,
        layer: LayerData,
    },
    RemoveLayer {
        index: usize,
        layer: LayerData,
    },
    Reorder {
        id: LayerId,
        from: usize,
        to: usize,
    },
    SetTransform {
        id: LayerId,
        before: Affine,
        after: Affine,
    },
    SetOpacity {
        id: LayerId,
        before: f32,
        after: f32,
    },
    SetBlendMode {
        id: LayerId,
        before: BlendMode,
        after: BlendMode,
    },
    SetVisibility {
        id: LayerId,
        before: bool,
        after: bool,
    },
    SetLayerMask {
        id: LayerId,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    },
    PaintMask {
        before: MaskPatch,
        after: MaskPatch,
    },
    /// Several mutations committed as one undo step — one user gesture
    /// moving a multi-selection is one entry, not one per layer.
    Group {
        name: String,
        entries: Vec<HistoryEntry>,
    },
}

impl HistoryEntry {
    pub fn description(&self) -> String {
        match self {
            HistoryEntry::AddLayer { layer, .. } => format!("Add Layer: {}", layer.name),
            HistoryEntry::RemoveLayer { layer, .. } => format!("Remove Layer: {}", layer.name),
            HistoryEntry::Reorder { from, to, .. } => format!("Move Layer {} to {}", from, to),
            HistoryEntry::SetTransform { .. } => "Transform Layer".to_string(),
            HistoryEntry::SetOpacity { after, .. } => {
                format!("Layer Opacity: {:.0}%", after * 100.0)
            }
            HistoryEntry::SetBlendMode { after, .. } => format!("Blend Mode: {}", after.name()),
            HistoryEntry::SetVisibility { after, .. } => {
                if *after { "Show Layer".to_string() } else { "Hide Layer".to_string() }
            }
            HistoryEntry::SetLayerMask { after, .. } => {
                if after.is_some() { "Set Layer Mask".to_string() } else { "Clear Layer Mask".to_string() }
            }
            HistoryEntry::PaintMask { .. } => "Paint Mask".to_string(),
            HistoryEntry::Group { name, .. } => name.clone(),
        }
    }

    /// Apply the forward delta ("redo" direction).
    pub fn apply(&self, doc: &mut Document) -> Result<(), ReplayError> {
        match self {
            HistoryEntry::AddLayer { index, layer } => {
                let live = layer.into_layer().ok_or(ReplayError::CorruptEntry)?;
                doc.apply_insert(*index, live);
                Ok(())
            }
            HistoryEntry::RemoveLayer { index, .. } => {
                doc.apply_remove(*index).ok_or(ReplayError::MissingTarget)?;
                Ok(())
            }
            HistoryEntry::Reorder { from, to, .. } => {
                if doc.apply_move(*from, *to) { Ok(()) } else { Err(ReplayError::MissingTarget) }
            }
            HistoryEntry::SetTransform { id, after, .. } => set_field(doc, *id, |l| l.transform = *after),
            HistoryEntry::SetOpacity { id, after, .. } => set_field(doc, *id, |l| l.opacity = *after),
            HistoryEntry::SetBlendMode { id, after, .. } => set_field(doc, *id, |l| l.blend_mode = *after),
            HistoryEntry::SetVisibility { id, after, .. } => set_field(doc, *id, |l| l.visible = *after),
            HistoryEntry::SetLayerMask { id, after, .. } => apply_layer_mask(doc, *id, after),
            HistoryEntry::PaintMask { after, .. } => {
                doc.apply_mask_patch(after);
                Ok(())
            }
            HistoryEntry::Group { entries, .. } => {
                for e in entries {
                    e.apply(doc)?;
                }
                Ok(())
            }
        }
    }

    /// Apply the inverse delta ("undo" direction).
    pub fn revert(&self, doc: &mut Document) -> Result<(), ReplayError> {
        match self {
            HistoryEntry::AddLayer { index, .. } => {
                doc.apply_remove(*index).ok_or(ReplayError::MissingTarget)?;
                Ok(())
            }
            HistoryEntry::RemoveLayer { index, layer } => {
                let live = layer.into_layer().ok_or(ReplayError::CorruptEntry)?;
                doc.apply_insert(*index, live);
                Ok(())
            }
            HistoryEntry::Reorder { from, to, .. } => {
                if doc.apply_move(*to, *from) { Ok(()) } else { Err(ReplayError::MissingTarget) }
            }
            HistoryEntry::SetTransform { id, before, .. } => set_field(doc, *id, |l| l.transform = *before),
            HistoryEntry::SetOpacity { id, before, .. } => set_field(doc, *id, |l| l.opacity = *before),
            HistoryEntry::SetBlendMode { id, before, .. } => set_field(doc, *id, |l| l.blend_mode = *before),
            HistoryEntry::SetVisibility { id, before, .. } => set_field(doc, *id, |l| l.visible = *before),
            HistoryEntry::SetLayerMask { id, before, .. } => apply_layer_mask(doc, *id, before),
            HistoryEntry::PaintMask { before, .. } => {
                doc.apply_mask_patch(before);
                Ok(())
            }
            HistoryEntry::Group { entries, .. } => {
                // Inverse of a sequence applies the inverses in reverse.
                for e in entries.iter().rev() {
                    e.revert(doc)?;
                }
                Ok(())
            }
        }
    }
}

fn set_field(
    doc: &mut Document,
    id: LayerId,
    f: impl FnOnce(&mut crate::canvas::Layer),
) -> Result<(), ReplayError> {
    let index = doc.index_of(id).ok_or(ReplayError::MissingTarget)?;
    f(&mut doc.layers[index]);
    doc.mark_dirty();
    Ok(())
}

fn apply_layer_mask(
    doc: &mut Document,
    id: LayerId,
    bytes: &Option<Vec<u8>>,
) -> Result<(), ReplayError> {
    let index = doc.index_of(id).ok_or(ReplayError::MissingTarget)?;
    let (w, h) = (doc.layers[index].width(), doc.layers[index].height());
    let mask = match bytes {
        Some(raw) => Some(std::sync::Arc::new(
            image::GrayImage::from_raw(w, h, raw.clone()).ok_or(ReplayError::CorruptEntry)?,
        )),
        None => None,
    };
    doc.layers[index].mask = mask;
    doc.mark_dirty();
    Ok(())
}

/// Replay failures. These indicate a corrupt entry or a document that
/// diverged from the recorded history — the step is refused, the session
/// keeps running.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReplayError {
    MissingTarget,
    CorruptEntry,
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::MissingTarget => write!(f, "History target no longer exists"),
            ReplayError::CorruptEntry => write!(f, "History entry pixel data is corrupt"),
        }
    }
}

impl std::error::Error for ReplayError {}

// ============================================================================
// HISTORY MANAGER — bounded undo/redo stacks
// ============================================================================

pub struct HistoryManager {
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: VecDeque<HistoryEntry>,
    max_entries: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(50)
    }
}

impl HistoryManager {
    pub fn new(max_entries: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Push a new entry. Any redo future is invalidated, and the oldest
    /// entries are dropped past the configured cap. Dropping is irreversible
    /// but safe: entries are self-contained.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.redo_stack.clear();
        self.undo_stack.push_back(entry);
        while self.undo_stack.len() > self.max_entries {
            self.undo_stack.pop_front();
        }
    }

    /// Undo the most recent entry. Returns its description, or `None` when
    /// the stack is empty (silent no-op). A failed inverse-apply refuses the
    /// step — the entry goes back on the stack untouched.
    pub fn undo(&mut self, doc: &mut Document) -> Option<String> {
        let entry = self.undo_stack.pop_back()?;
        match entry.revert(doc) {
            Ok(()) => {
                let desc = entry.description();
                self.redo_stack.push_back(entry);
                Some(desc)
            }
            Err(e) => {
                log_err!("Undo refused ({}): {}", entry.description(), e);
                self.undo_stack.push_back(entry);
                None
            }
        }
    }

    /// Redo the most recently undone entry. Symmetric to [`undo`](Self::undo).
    pub fn redo(&mut self, doc: &mut Document) -> Option<String> {
        let entry = self.redo_stack.pop_back()?;
        match entry.apply(doc) {
            Ok(()) => {
                let desc = entry.description();
                self.undo_stack.push_back(entry);
                Some(desc)
            }
            Err(e) => {
                log_err!("Redo refused ({}): {}", entry.description(), e);
                self.redo_stack.push_back(entry);
                None
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    /// Most-recent-first descriptions, for a history panel.
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|e| e.description()).collect()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================
