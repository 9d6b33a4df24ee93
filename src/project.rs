//! Document snapshot persistence.
//!
//! Snapshots are bincode files carrying a magic string, so a stray file
//! handed to the loader fails fast instead of deserializing garbage.
//! Dimension and layer-count limits bound what a corrupt or hostile file can
//! make the loader allocate.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::canvas::{Document, LayerData};
use crate::log_info;

const MAGIC: &str = "LFD1";

/// Upper bound on either canvas axis.
pub const MAX_CANVAS_DIM: u32 = 32_768;
/// Upper bound on the layer count.
pub const MAX_LAYERS: usize = 256;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum ProjectError {
    Io(io::Error),
    Serialize(bincode::Error),
    /// Wrong magic, impossible dimensions, or corrupt layer data.
    InvalidFormat(String),
}

impl fmt::Display for ProjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectError::Io(e) => write!(f, "Project I/O error: {}", e),
            ProjectError::Serialize(e) => write!(f, "Project serialization error: {}", e),
            ProjectError::InvalidFormat(m) => write!(f, "Invalid project file: {}", m),
        }
    }
}

impl std::error::Error for ProjectError {}

impl From<io::Error> for ProjectError {
    fn from(e: io::Error) -> Self {
        ProjectError::Io(e)
    }
}

impl From<bincode::Error> for ProjectError {
    fn from(e: bincode::Error) -> Self {
        ProjectError::Serialize(e)
    }
}

// ============================================================================
// FILE FORMAT
// ============================================================================

#[derive(Serialize, Deserialize)]
struct DocumentFile {
    magic: String,
    id: String,
    width: u32,
    height: u32,
    mask: Option<Vec<u8>>,
    layers: Vec<LayerData>,
}

impl DocumentFile {
    fn from_document(doc: &Document) -> Self {
        Self {
            magic: MAGIC.to_string(),
            id: doc.id.clone(),
            width: doc.width,
            height: doc.height,
            mask: doc.mask.as_ref().map(|m| m.as_raw().clone()),
            layers: doc.layers.iter().map(LayerData::from_layer).collect(),
        }
    }

    fn validate(&self) -> Result<(), ProjectError> {
        if self.magic != MAGIC {
            return Err(ProjectError::InvalidFormat(format!(
                "bad magic {:?}, expected {:?}",
                self.magic, MAGIC
            )));
        }
        if self.width == 0
            || self.height == 0
            || self.width > MAX_CANVAS_DIM
            || self.height > MAX_CANVAS_DIM
        {
            return Err(ProjectError::InvalidFormat(format!(
                "canvas dimensions {}x{} out of range",
                self.width, self.height
            )));
        }
        if self.layers.len() > MAX_LAYERS {
            return Err(ProjectError::InvalidFormat(format!(
                "{} layers exceeds the {} layer limit",
                self.layers.len(),
                MAX_LAYERS
            )));
        }
        Ok(())
    }

    fn into_document(self) -> Result<Document, ProjectError> {
        self.validate()?;

        let mut doc = Document::new(self.id, self.width, self.height);
        if let Some(bytes) = self.mask {
            let mask = GrayImage::from_raw(self.width, self.height, bytes).ok_or_else(|| {
                ProjectError::InvalidFormat("document mask byte count mismatch".to_string())
            })?;
            doc.mask = Some(mask);
        }
        for (i, data) in self.layers.iter().enumerate() {
            let layer = data.into_layer().ok_or_else(|| {
                ProjectError::InvalidFormat(format!("layer {} pixel data is corrupt", i))
            })?;
            doc.layers.push(layer);
        }
        Ok(doc)
    }
}

// ============================================================================
// SAVE / LOAD
// ============================================================================

pub fn save_document(doc: &Document, path: &Path) -> Result<(), ProjectError> {
    let file = DocumentFile::from_document(doc);
    let bytes = bincode::serialize(&file)?;
    fs::write(path, bytes)?;
    log_info!("Saved document {:?} ({} layers) to {:?}", doc.id, doc.layers.len(), path);
    Ok(())
}

pub fn load_document(path: &Path) -> Result<Document, ProjectError> {
    let bytes = fs::read(path)?;
    let file: DocumentFile = bincode::deserialize(&bytes)
        .map_err(|e| ProjectError::InvalidFormat(e.to_string()))?;
    let doc = file.into_document()?;
    log_info!("Loaded document {:?} ({} layers) from {:?}", doc.id, doc.layers.len(), path);
    Ok(doc)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Affine, BlendMode};
    use image::{Rgba, RgbaImage};

    fn temp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("layerforge-test-project");
        let _ = fs::create_dir_all(&dir);
        dir.join(name)
    }

    fn sample_document() -> Document {
        let mut doc = Document::new("doc-1", 64, 48);
        let (id, _) = doc.add_layer(RgbaImage::from_pixel(10, 10, Rgba([5, 6, 7, 255])), None);
        doc.set_transform(
            id,
            Affine { tx: 3.0, ty: -2.0, scale_x: 1.5, scale_y: 0.5, rotation: 0.2 },
        )
        .unwrap();
        doc.set_opacity(id, 0.7).unwrap();
        doc.set_blend_mode(id, BlendMode::Screen).unwrap();
        doc.add_layer(RgbaImage::from_pixel(20, 5, Rgba([9, 0, 9, 128])), None);
        let _ = doc.paint_mask_stroke(&[(8.0, 8.0)], 4.0, 0);
        doc
    }

    #[test]
    fn document_roundtrips_exactly() {
        let doc = sample_document();
        let path = temp_path("roundtrip.lfd");
        save_document(&doc, &path).unwrap();
        let loaded = load_document(&path).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let doc = sample_document();
        let mut file = DocumentFile::from_document(&doc);
        file.magic = "NOPE".to_string();
        let path = temp_path("badmagic.lfd");
        fs::write(&path, bincode::serialize(&file).unwrap()).unwrap();

        assert!(matches!(load_document(&path), Err(ProjectError::InvalidFormat(_))));
    }

    #[test]
    fn out_of_range_dimensions_are_rejected() {
        let doc = sample_document();
        let mut file = DocumentFile::from_document(&doc);
        file.width = MAX_CANVAS_DIM + 1;
        let path = temp_path("toobig.lfd");
        fs::write(&path, bincode::serialize(&file).unwrap()).unwrap();

        assert!(matches!(load_document(&path), Err(ProjectError::InvalidFormat(_))));
    }

    #[test]
    fn corrupt_layer_bytes_are_rejected() {
        let doc = sample_document();
        let mut file = DocumentFile::from_document(&doc);
        file.layers[0].pixels.truncate(7);
        let path = temp_path("corrupt.lfd");
        fs::write(&path, bincode::serialize(&file).unwrap()).unwrap();

        assert!(matches!(load_document(&path), Err(ProjectError::InvalidFormat(_))));
    }

    #[test]
    fn garbage_file_is_rejected_not_panicking() {
        let path = temp_path("garbage.lfd");
        fs::write(&path, b"this is not a project file").unwrap();
        assert!(matches!(load_document(&path), Err(ProjectError::InvalidFormat(_))));
    }
}
