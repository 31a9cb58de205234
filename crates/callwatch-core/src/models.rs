//! Process-wide model registry.
//!
//! Owns the detector and every embedder variant, loading each on first use
//! (downloading weights when a source URL is known) and keeping it for the
//! life of the process once loaded. A failed load is attempted again on the
//! next call. Construct one at startup and share it by reference.

use crate::detector::{crop_faces, FaceDetector, ScrfdDetector};
use crate::embedder::{variant_spec, EmbedError, FaceEmbedder, OnnxEmbedder};
use crate::types::{Embedding, FaceCrop};
use image::RgbImage;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Detector weights file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "scrfd_500m_bnkps.onnx";

/// Where the detector weights are fetched from when absent.
pub const DEFAULT_DETECTOR_URL: &str =
    "https://huggingface.co/ykk648/face_lib/resolve/main/face_detect/scrfd_onnx/scrfd_500m_bnkps.onnx";

// ONNX files smaller than this are error pages, not models.
const MIN_MODEL_BYTES: usize = 1024;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file {0} is missing and no download source is configured")]
    NoSource(String),
    #[error("download from {url} failed: {reason}")]
    Download { url: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Where model weights live and where to fetch them from.
#[derive(Debug, Clone)]
pub struct ModelSources {
    pub model_dir: PathBuf,
    /// Full URL of the detector weights.
    pub detector_url: Option<String>,
    /// Base URL for embedder weights; `<base>/<variant>.onnx` is fetched.
    pub embedder_base_url: Option<String>,
}

/// A model that is either loaded or still to be loaded. Failed loads are
/// retried on the next call; the last failure reason throttles the warning.
enum Slot<T> {
    Unloaded { last_failure: Option<String> },
    Ready(T),
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Slot::Unloaded { last_failure: None }
    }

    /// Load into the slot if it is not ready yet. Returns the failure reason
    /// when the load did not succeed.
    fn ensure(&mut self, what: &str, load: impl FnOnce() -> Result<T, String>) -> Result<&mut T, String> {
        if let Slot::Unloaded { last_failure } = self {
            match load() {
                Ok(model) => {
                    if last_failure.is_some() {
                        tracing::info!(model = what, "model loaded after earlier failure");
                    }
                    *self = Slot::Ready(model);
                }
                Err(reason) => {
                    if last_failure.as_deref() != Some(reason.as_str()) {
                        tracing::warn!(model = what, %reason, "model unavailable; will retry on next use");
                    } else {
                        tracing::debug!(model = what, %reason, "model still unavailable");
                    }
                    *last_failure = Some(reason.clone());
                    return Err(reason);
                }
            }
        }
        match self {
            Slot::Ready(model) => Ok(model),
            Slot::Unloaded { .. } => Err("not loaded".to_string()),
        }
    }
}

/// Lazily-loaded detector and embedder models.
///
/// Inference runs under a mutex per model family, so one registry can be
/// shared between threads. Readiness is published separately so status
/// queries never wait behind a download or an inference.
pub struct ModelRegistry {
    sources: ModelSources,
    detector: Mutex<Slot<ScrfdDetector>>,
    embedders: Mutex<HashMap<String, Slot<OnnxEmbedder>>>,
    detector_ready: AtomicBool,
    ready_variants: RwLock<BTreeSet<String>>,
}

impl ModelRegistry {
    pub fn new(sources: ModelSources) -> Self {
        Self {
            sources,
            detector: Mutex::new(Slot::empty()),
            embedders: Mutex::new(HashMap::new()),
            detector_ready: AtomicBool::new(false),
            ready_variants: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn sources(&self) -> &ModelSources {
        &self.sources
    }

    /// Whether the detector has been loaded successfully.
    pub fn detector_ready(&self) -> bool {
        self.detector_ready.load(Ordering::Acquire)
    }

    /// Names of embedder variants loaded so far, sorted.
    pub fn loaded_variants(&self) -> Vec<String> {
        let ready = self.ready_variants.read().unwrap_or_else(PoisonError::into_inner);
        ready.iter().cloned().collect()
    }

    fn load_detector(&self) -> Result<ScrfdDetector, String> {
        let path = ensure_model_file(
            &self.sources.model_dir,
            DETECTOR_MODEL_FILE,
            self.sources.detector_url.as_deref(),
        )
        .map_err(|e| e.to_string())?;
        let detector = ScrfdDetector::load(&path).map_err(|e| e.to_string())?;
        self.detector_ready.store(true, Ordering::Release);
        Ok(detector)
    }

    fn load_embedder(&self, variant: &str) -> Result<OnnxEmbedder, String> {
        let spec = variant_spec(variant).map_err(|e| e.to_string())?;
        let file_name = spec.file_name();
        let url = self
            .sources
            .embedder_base_url
            .as_deref()
            .map(|base| format!("{}/{file_name}", base.trim_end_matches('/')));

        let path = ensure_model_file(&self.sources.model_dir, &file_name, url.as_deref()).map_err(|e| e.to_string())?;
        let embedder = OnnxEmbedder::load(&path, spec).map_err(|e| e.to_string())?;
        self.ready_variants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(variant.to_string());
        Ok(embedder)
    }
}

impl FaceDetector for ModelRegistry {
    fn detect(&self, image: &RgbImage) -> Vec<FaceCrop> {
        let mut slot = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        let Ok(detector) = slot.ensure("detector", || self.load_detector()) else {
            return Vec::new();
        };

        match detector.detect_boxes(image) {
            Ok(boxes) => crop_faces(image, &boxes),
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; treating as no faces");
                Vec::new()
            }
        }
    }
}

impl FaceEmbedder for ModelRegistry {
    fn embed(&self, face: &FaceCrop, variant: &str) -> Result<Embedding, EmbedError> {
        variant_spec(variant)?;

        let mut map = self.embedders.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = map.entry(variant.to_string()).or_insert_with(Slot::empty);
        let embedder = slot
            .ensure(variant, || self.load_embedder(variant))
            .map_err(|reason| EmbedError::Unavailable {
                variant: variant.to_string(),
                reason,
            })?;
        embedder.extract(face)
    }
}

/// Path to `file_name` in `model_dir`, downloading it from `url` if absent.
pub fn ensure_model_file(model_dir: &Path, file_name: &str, url: Option<&str>) -> Result<PathBuf, ModelError> {
    let path = model_dir.join(file_name);
    if path.is_file() {
        return Ok(path);
    }

    let url = url.ok_or_else(|| ModelError::NoSource(path.display().to_string()))?;
    tracing::info!(url, dest = %path.display(), "downloading model weights");
    download_file(url, &path)?;
    Ok(path)
}

/// Fetch `url` into `dest`, writing through a `.part` file so a partial
/// download never looks like a model.
fn download_file(url: &str, dest: &Path) -> Result<(), ModelError> {
    let fail = |reason: String| ModelError::Download {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| fail(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| fail(e.to_string()))?;
    let bytes = response.bytes().map_err(|e| fail(e.to_string()))?;

    if bytes.len() < MIN_MODEL_BYTES {
        return Err(fail(format!("suspiciously small payload ({} bytes)", bytes.len())));
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    std::fs::write(&part, &bytes)?;
    std::fs::rename(&part, dest)?;

    tracing::info!(dest = %dest.display(), bytes = bytes.len(), "model downloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelRect;
    use image::Rgb;

    fn offline_registry(dir: &Path) -> ModelRegistry {
        ModelRegistry::new(ModelSources {
            model_dir: dir.to_path_buf(),
            detector_url: None,
            embedder_base_url: None,
        })
    }

    fn face() -> FaceCrop {
        FaceCrop {
            image: RgbImage::from_pixel(40, 40, Rgb([90, 90, 90])),
            rect: PixelRect { x: 0, y: 0, width: 40, height: 40 },
            confidence: 0.9,
        }
    }

    #[test]
    fn test_missing_detector_yields_no_faces() {
        let dir = tempfile::tempdir().unwrap();
        let models = offline_registry(dir.path());

        let image = RgbImage::from_pixel(64, 64, Rgb([200, 180, 160]));
        assert!(models.detect(&image).is_empty());
        assert!(models.detect(&image).is_empty());
        assert!(!models.detector_ready());
    }

    #[test]
    fn test_failed_embedder_load_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let models = offline_registry(dir.path());

        let first = models.embed(&face(), "edgeface_xxs").unwrap_err();
        let EmbedError::Unavailable { reason: first, .. } = first else {
            panic!("expected Unavailable, got {first:?}");
        };
        assert!(first.contains("no download source"), "{first}");

        // Weights show up between ticks; the next call must look again
        // instead of replaying the stored failure.
        std::fs::write(dir.path().join("edgeface_xxs.onnx"), vec![0u8; 2048]).unwrap();
        let second = models.embed(&face(), "edgeface_xxs").unwrap_err();
        let EmbedError::Unavailable { reason: second, .. } = second else {
            panic!("expected Unavailable, got {second:?}");
        };
        assert!(!second.contains("no download source"), "{second}");
        assert!(models.loaded_variants().is_empty());
    }

    #[test]
    fn test_slot_retries_until_ready() {
        let mut slot: Slot<u32> = Slot::empty();
        let mut attempts = 0;

        assert!(slot.ensure("test", || { attempts += 1; Err("not yet".into()) }).is_err());
        assert!(slot.ensure("test", || { attempts += 1; Err("not yet".into()) }).is_err());
        assert_eq!(*slot.ensure("test", || { attempts += 1; Ok(7) }).unwrap(), 7);
        // Ready is memoized.
        assert_eq!(*slot.ensure("test", || { attempts += 1; Ok(8) }).unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_readiness_does_not_wait_on_inference_lock() {
        let dir = tempfile::tempdir().unwrap();
        let models = offline_registry(dir.path());

        let _held = models.detector.lock().unwrap();
        let _held_embedders = models.embedders.lock().unwrap();
        assert!(!models.detector_ready());
        assert!(models.loaded_variants().is_empty());
    }

    #[test]
    fn test_undecodable_path_yields_no_faces() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("not-an-image.png");
        std::fs::write(&bogus, b"definitely not a png").unwrap();

        let models = offline_registry(dir.path());
        assert!(models.detect_path(&bogus).is_empty());
        assert!(models.detect_path(&dir.path().join("missing.jpg")).is_empty());
    }

    #[test]
    fn test_missing_embedder_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let models = offline_registry(dir.path());

        let err = models.embed(&face(), "edgeface_xxs").unwrap_err();
        assert!(matches!(err, EmbedError::Unavailable { .. }), "got {err:?}");
        assert!(models.loaded_variants().is_empty());
    }

    #[test]
    fn test_unknown_variant_rejected_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let models = offline_registry(dir.path());

        let err = models.embed(&face(), "resnet_from_nowhere").unwrap_err();
        assert!(matches!(err, EmbedError::UnknownVariant(_)));
    }

    #[test]
    fn test_ensure_model_file_prefers_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DETECTOR_MODEL_FILE);
        std::fs::write(&path, b"weights").unwrap();

        let found = ensure_model_file(dir.path(), DETECTOR_MODEL_FILE, None).unwrap();
        assert_eq!(found, path);
    }

    #[test]
    fn test_ensure_model_file_without_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_model_file(dir.path(), "absent.onnx", None).unwrap_err();
        assert!(matches!(err, ModelError::NoSource(_)));
    }
}
