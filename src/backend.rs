//! Backend execution entry point: turns pushed canvas output into host
//! tensors, with epoch-scoped caching and never-fail semantics.
//!
//! `process_canvas` is called by the host's execution graph and must not
//! propagate errors into it: every failure path degrades to the last cached
//! pair or a deterministic blank placeholder.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use image::{GrayImage, RgbaImage};

use crate::encode;
use crate::gate::ExecutionGate;
use crate::protocol::CanvasPayload;
use crate::sync::TransferStore;
use crate::{log_err, log_info, log_warn};

/// Placeholder dimensions when there is nothing to show.
pub const BLANK_SIZE: u32 = 512;

const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "webp"];

// ============================================================================
// TENSORS — the host's float convention
// ============================================================================

/// Batch-of-one RGB image tensor, shape [1, H, W, 3], float32 in [0, 1].
#[derive(Clone, Debug, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub height: u32,
    pub width: u32,
}

impl ImageTensor {
    pub fn from_rgba(img: &RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for p in img.pixels() {
            data.push(p[0] as f32 / 255.0);
            data.push(p[1] as f32 / 255.0);
            data.push(p[2] as f32 / 255.0);
        }
        Self { data, height, width }
    }

    /// Deterministic all-zero placeholder.
    pub fn blank(width: u32, height: u32) -> Self {
        Self { data: vec![0.0; (width * height * 3) as usize], height, width }
    }
}

/// Batch-of-one mask tensor, shape [1, H, W], float32 in [0, 1].
#[derive(Clone, Debug, PartialEq)]
pub struct MaskTensor {
    pub data: Vec<f32>,
    pub height: u32,
    pub width: u32,
}

impl MaskTensor {
    pub fn from_gray(img: &GrayImage) -> Self {
        let (width, height) = img.dimensions();
        let data = img.pixels().map(|p| p[0] as f32 / 255.0).collect();
        Self { data, height, width }
    }

    pub fn blank(width: u32, height: u32) -> Self {
        Self { data: vec![0.0; (width * height) as usize], height, width }
    }
}

// ============================================================================
// EXECUTION EPOCHS
// ============================================================================

/// Identifier of one backend invocation cycle. Derived from the wall clock
/// in milliseconds; strictly increasing even when the clock stalls or steps
/// backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExecutionEpoch(pub u64);

static LAST_EPOCH: AtomicU64 = AtomicU64::new(0);

impl ExecutionEpoch {
    pub fn now() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut prev = LAST_EPOCH.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match LAST_EPOCH.compare_exchange_weak(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return ExecutionEpoch(next),
                Err(seen) => prev = seen,
            }
        }
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// Host-supplied flags for one execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessOptions {
    /// Scale oversized incoming images down to the canvas on add.
    pub fit_on_add: bool,
    /// Whether the host wants the composite echoed back for preview.
    pub show_preview: bool,
}

struct NodeCache {
    image: RgbaImage,
    mask: GrayImage,
    epoch: ExecutionEpoch,
}

/// Per-process execution backend. Holds the single-flight gate and the
/// per-node output cache; both shared-state pieces sit behind one mutex and
/// one atomic, the only synchronization the backend needs.
pub struct CanvasBackend {
    gate: ExecutionGate,
    cache: Mutex<HashMap<String, NodeCache>>,
}

impl Default for CanvasBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasBackend {
    pub fn new() -> Self {
        Self { gate: ExecutionGate::new(), cache: Mutex::new(HashMap::new()) }
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    /// One composite-and-deliver cycle. Never fails: every error path
    /// degrades to the cached pair or the blank placeholder.
    ///
    /// Source priority: the pending transfer for this node, then the host's
    /// upstream tensors, then the blank placeholder. Within one epoch a
    /// repeated call returns the cached pair without recomputation.
    pub fn process_canvas(
        &self,
        opts: ProcessOptions,
        node_id: &str,
        upstream_image: Option<&RgbaImage>,
        upstream_mask: Option<&GrayImage>,
        transfers: &TransferStore,
        epoch: ExecutionEpoch,
    ) -> (ImageTensor, MaskTensor) {
        let Some(_permit) = self.gate.try_enter() else {
            log_warn!("Execution gate busy for node {}; serving cached output", node_id);
            return self.cached_or_blank(node_id);
        };

        log_info!(
            "Executing node {} (epoch {}, fit_on_add: {}, show_preview: {})",
            node_id,
            epoch.0,
            opts.fit_on_add,
            opts.show_preview
        );

        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = cache.get(node_id)
                && entry.epoch == epoch
            {
                return (ImageTensor::from_rgba(&entry.image), MaskTensor::from_gray(&entry.mask));
            }
        }

        let (image, mask) = match transfers.take(node_id) {
            Some(transfer) => {
                let image = transfer.image.unwrap_or_else(blank_image);
                let mask = transfer
                    .mask
                    .filter(|m| m.dimensions() == image.dimensions())
                    .unwrap_or_else(|| opaque_mask(&image));
                (image, mask)
            }
            None => match upstream_image {
                Some(img) => {
                    let mask = upstream_mask
                        .filter(|m| m.dimensions() == img.dimensions())
                        .cloned()
                        .unwrap_or_else(|| opaque_mask(img));
                    (img.clone(), mask)
                }
                None => {
                    // Persisted output survives epoch transitions: with no
                    // fresh input the last successful pair is re-delivered.
                    let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
                    if let Some(entry) = cache.get_mut(node_id) {
                        entry.epoch = epoch;
                        return (
                            ImageTensor::from_rgba(&entry.image),
                            MaskTensor::from_gray(&entry.mask),
                        );
                    }
                    drop(cache);

                    log_info!("No transfer, upstream, or cache for node {}; blank placeholder", node_id);
                    return self.store_and_tensor(
                        node_id,
                        blank_image(),
                        GrayImage::new(BLANK_SIZE, BLANK_SIZE),
                        epoch,
                    );
                }
            },
        };

        self.store_and_tensor(node_id, image, mask, epoch)
    }

    fn store_and_tensor(
        &self,
        node_id: &str,
        image: RgbaImage,
        mask: GrayImage,
        epoch: ExecutionEpoch,
    ) -> (ImageTensor, MaskTensor) {
        let tensors = (ImageTensor::from_rgba(&image), MaskTensor::from_gray(&mask));
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(node_id.to_string(), NodeCache { image, mask, epoch });
        tensors
    }

    fn cached_or_blank(&self, node_id: &str) -> (ImageTensor, MaskTensor) {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        match cache.get(node_id) {
            Some(entry) => {
                (ImageTensor::from_rgba(&entry.image), MaskTensor::from_gray(&entry.mask))
            }
            None => (
                ImageTensor::blank(BLANK_SIZE, BLANK_SIZE),
                MaskTensor::blank(BLANK_SIZE, BLANK_SIZE),
            ),
        }
    }

    /// The cached composite for a node as data URIs. Empty cache is a
    /// normal state and returns null fields, not an error.
    pub fn canvas_data(&self, node_id: &str) -> CanvasPayload {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let Some(entry) = cache.get(node_id) else {
            return CanvasPayload::default();
        };

        let image = match encode::encode_rgba_data_uri(&entry.image) {
            Ok(uri) => Some(uri),
            Err(e) => {
                log_err!("Failed to encode cached image for node {}: {}", node_id, e);
                None
            }
        };
        let mask = match encode::encode_gray_data_uri(&entry.mask) {
            Ok(uri) => Some(uri),
            Err(e) => {
                log_err!("Failed to encode cached mask for node {}: {}", node_id, e);
                None
            }
        };
        CanvasPayload { image, mask }
    }

    /// Forget every cached pair. Used on document reset.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

fn blank_image() -> RgbaImage {
    RgbaImage::new(BLANK_SIZE, BLANK_SIZE)
}

fn opaque_mask(img: &RgbaImage) -> GrayImage {
    GrayImage::from_pixel(img.width(), img.height(), image::Luma([255]))
}

// ============================================================================
// FILESYSTEM QUERIES
// ============================================================================

#[derive(Debug)]
pub enum LoadError {
    NotFound(String),
    InvalidExtension(String),
    Decode(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound(p) => write!(f, "File not found: {}", p),
            LoadError::InvalidExtension(ext) => {
                write!(f, "Unsupported image extension: {:?}", ext)
            }
            LoadError::Decode(m) => write!(f, "Failed to decode image: {}", m),
        }
    }
}

impl std::error::Error for LoadError {}

/// An image loaded from the server's filesystem.
#[derive(Debug)]
pub struct LoadedImage {
    pub uri: String,
    pub width: u32,
    pub height: u32,
}

/// Load an image file for the interactive surface. Checks run in order:
/// existence, extension whitelist, decodability. No state changes on any
/// failure.
pub fn load_image_from_path(path: &Path) -> Result<LoadedImage, LoadError> {
    if !path.is_file() {
        return Err(LoadError::NotFound(path.display().to_string()));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(LoadError::InvalidExtension(ext));
    }

    let bytes = fs::read(path).map_err(|e| LoadError::Decode(e.to_string()))?;
    let img = image::load_from_memory(&bytes).map_err(|e| LoadError::Decode(e.to_string()))?;

    Ok(LoadedImage {
        uri: encode::encode_raw_bytes_data_uri(&bytes),
        width: img.width(),
        height: img.height(),
    })
}

/// Data URIs of output-directory images modified after `since_ms` (unix
/// milliseconds), oldest first. Non-image files and unreadable entries are
/// skipped.
pub fn latest_output_images(output_dir: &Path, since_ms: u64) -> Vec<String> {
    let Ok(entries) = fs::read_dir(output_dir) else {
        log_warn!("Output directory {:?} is not readable", output_dir);
        return Vec::new();
    };

    let mut found: Vec<(u64, Vec<u8>)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else { continue };
        let modified_ms = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if modified_ms <= since_ms {
            continue;
        }

        match fs::read(&path) {
            Ok(bytes) => found.push((modified_ms, bytes)),
            Err(e) => log_warn!("Skipping unreadable output file {:?}: {}", path, e),
        }
    }

    found.sort_by_key(|(ms, _)| *ms);
    found
        .into_iter()
        .map(|(_, bytes)| encode::encode_raw_bytes_data_uri(&bytes))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(w: u32, h: u32, v: u8) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([v, v, v, 255]))
    }

    #[test]
    fn epochs_strictly_increase() {
        let a = ExecutionEpoch::now();
        let b = ExecutionEpoch::now();
        let c = ExecutionEpoch::now();
        assert!(a < b && b < c);
    }

    #[test]
    fn tensor_conversion_normalizes() {
        let img = solid(2, 2, 255);
        let t = ImageTensor::from_rgba(&img);
        assert_eq!(t.data.len(), 2 * 2 * 3);
        assert!(t.data.iter().all(|&v| (v - 1.0).abs() < 1e-6));

        let mask = GrayImage::from_pixel(2, 2, image::Luma([0]));
        let m = MaskTensor::from_gray(&mask);
        assert!(m.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn no_input_yields_blank_placeholder() {
        let backend = CanvasBackend::new();
        let transfers = TransferStore::new();
        let (img, mask) = backend.process_canvas(
            ProcessOptions::default(),
            "n1",
            None,
            None,
            &transfers,
            ExecutionEpoch::now(),
        );
        assert_eq!((img.width, img.height), (BLANK_SIZE, BLANK_SIZE));
        assert!(img.data.iter().all(|&v| v == 0.0));
        assert_eq!((mask.width, mask.height), (BLANK_SIZE, BLANK_SIZE));
    }

    #[test]
    fn transfer_beats_upstream_and_is_consumed_once() {
        let backend = CanvasBackend::new();
        let transfers = TransferStore::new();
        transfers.push("n1", Some(solid(4, 4, 200)), None);
        let upstream = solid(8, 8, 10);

        let (img, _) = backend.process_canvas(
            ProcessOptions::default(),
            "n1",
            Some(&upstream),
            None,
            &transfers,
            ExecutionEpoch::now(),
        );
        assert_eq!((img.width, img.height), (4, 4));
        assert!((img.data[0] - 200.0 / 255.0).abs() < 1e-6);

        // The transfer was consumed; the next epoch falls back to upstream.
        let (img, _) = backend.process_canvas(
            ProcessOptions::default(),
            "n1",
            Some(&upstream),
            None,
            &transfers,
            ExecutionEpoch::now(),
        );
        assert_eq!((img.width, img.height), (8, 8));
    }

    #[test]
    fn same_epoch_returns_cached_without_consuming_new_transfer() {
        let backend = CanvasBackend::new();
        let transfers = TransferStore::new();
        let epoch = ExecutionEpoch::now();

        transfers.push("n1", Some(solid(4, 4, 100)), None);
        let (first, _) =
            backend.process_canvas(ProcessOptions::default(), "n1", None, None, &transfers, epoch);

        // A new push lands, but the epoch has not advanced.
        transfers.push("n1", Some(solid(4, 4, 250)), None);
        let (second, _) =
            backend.process_canvas(ProcessOptions::default(), "n1", None, None, &transfers, epoch);

        assert_eq!(first, second);
        assert_eq!(transfers.len(), 1);
    }

    #[test]
    fn new_epoch_without_input_serves_persisted_cache() {
        let backend = CanvasBackend::new();
        let transfers = TransferStore::new();
        transfers.push("n1", Some(solid(4, 4, 60)), None);
        let (first, _) = backend.process_canvas(
            ProcessOptions::default(),
            "n1",
            None,
            None,
            &transfers,
            ExecutionEpoch::now(),
        );

        let (second, _) = backend.process_canvas(
            ProcessOptions::default(),
            "n1",
            None,
            None,
            &transfers,
            ExecutionEpoch::now(),
        );
        assert_eq!(second, first);
        assert_eq!((second.width, second.height), (4, 4));
    }

    #[test]
    fn busy_gate_serves_cached_pair() {
        let backend = CanvasBackend::new();
        let transfers = TransferStore::new();
        transfers.push("n1", Some(solid(4, 4, 77)), None);
        let (cached, _) = backend.process_canvas(
            ProcessOptions::default(),
            "n1",
            None,
            None,
            &transfers,
            ExecutionEpoch::now(),
        );

        let _held = backend.gate().try_enter().unwrap();
        let (img, _) = backend.process_canvas(
            ProcessOptions::default(),
            "n1",
            None,
            None,
            &transfers,
            ExecutionEpoch::now(),
        );
        assert_eq!(img, cached);
    }

    #[test]
    fn canvas_data_is_null_until_first_execution() {
        let backend = CanvasBackend::new();
        let payload = backend.canvas_data("never-ran");
        assert!(payload.image.is_none());
        assert!(payload.mask.is_none());
    }

    #[test]
    fn load_image_rejects_wrong_extension_before_reading() {
        let dir = std::env::temp_dir().join("layerforge-test-load");
        let _ = fs::create_dir_all(&dir);
        let txt = dir.join("notes.txt");
        fs::write(&txt, b"hello").unwrap();

        let err = load_image_from_path(&txt).unwrap_err();
        assert!(matches!(err, LoadError::InvalidExtension(ext) if ext == "txt"));

        let missing = dir.join("nope.png");
        let err = load_image_from_path(&missing).unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn load_image_returns_dimensions_for_valid_png() {
        let dir = std::env::temp_dir().join("layerforge-test-load");
        let _ = fs::create_dir_all(&dir);
        let png = dir.join("valid.png");
        solid(6, 3, 40).save(&png).unwrap();

        let loaded = load_image_from_path(&png).unwrap();
        assert_eq!((loaded.width, loaded.height), (6, 3));
        assert!(loaded.uri.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn latest_output_images_filters_by_timestamp() {
        let dir = std::env::temp_dir().join("layerforge-test-outputs");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        solid(2, 2, 1).save(dir.join("a.png")).unwrap();
        fs::write(dir.join("ignore.txt"), b"x").unwrap();

        let all = latest_output_images(&dir, 0);
        assert_eq!(all.len(), 1);

        let future = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
            + 60_000;
        assert!(latest_output_images(&dir, future).is_empty());
    }
}
