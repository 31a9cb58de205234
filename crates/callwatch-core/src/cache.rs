//! Registry embedding cache.
//!
//! Built offline by running the detector and embedder over every registry
//! photo once, persisted as a single checksummed blob, and loaded read-only at
//! daemon startup so live matching never re-embeds registry photos.
//!
//! The blob is a bincode-encoded [`CacheFile`] (little-endian, fixed-width
//! integers, `u64` length prefixes) followed by the SHA-256 of those bytes.
//! It opens with the `CWEC` magic and the format version.

use crate::detector::FaceDetector;
use crate::embedder::{EmbedError, FaceEmbedder};
use crate::registry::RegistryEntry;
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"CWEC";
const FORMAT_VERSION: u32 = 1;
const CHECKSUM_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file is empty")]
    Empty,
    #[error("not an embedding cache (bad magic)")]
    BadMagic,
    #[error("unsupported cache format version {0}")]
    UnsupportedVersion(u32),
    #[error("cache file truncated")]
    Truncated,
    #[error("cache payload has {0} trailing bytes")]
    TrailingBytes(u64),
    #[error("cache payload undecodable: {0}")]
    Decode(#[from] bincode::Error),
    #[error("cache checksum mismatch")]
    ChecksumMismatch,
    #[error("embedding variant {found} does not match {expected}")]
    VariantMismatch { expected: String, found: String },
    #[error("embedding for {identifier} has {found} dims, cache holds {expected}")]
    DimensionMismatch {
        identifier: String,
        expected: usize,
        found: usize,
    },
    #[error("no face detected in registry photo for {0}")]
    NoFace(String),
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// What the offline builder does with a registry photo that has no detectable face.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFacePolicy {
    /// Omit the entry, debug log only.
    Skip,
    /// Omit the entry, log a warning and list it in the build report.
    #[default]
    Warn,
    /// Abort the build.
    Fail,
}

/// Leading fields shared by every format version.
#[derive(Serialize, Deserialize)]
struct CacheHeader {
    magic: [u8; 4],
    version: u32,
}

/// On-disk form of an [`EmbeddingCache`], before the checksum trailer.
#[derive(Serialize, Deserialize)]
struct CacheFile {
    magic: [u8; 4],
    version: u32,
    variant: String,
    dim: u32,
    entries: Vec<StoredEntry>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    identifier: String,
    values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub identifier: String,
    pub embedding: Embedding,
}

/// Ordered identifier → embedding mapping, all of one variant and dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingCache {
    variant: String,
    entries: Vec<CacheEntry>,
}

impl EmbeddingCache {
    pub fn new(variant: impl Into<String>) -> Self {
        Self {
            variant: variant.into(),
            entries: Vec::new(),
        }
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimension, once the cache holds anything.
    pub fn dim(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn get(&self, identifier: &str) -> Option<&Embedding> {
        self.entries
            .iter()
            .find(|e| e.identifier == identifier)
            .map(|e| &e.embedding)
    }

    /// Add or replace an entry. A replaced entry keeps its position.
    pub fn insert(&mut self, identifier: impl Into<String>, embedding: Embedding) -> Result<(), CacheError> {
        let identifier = identifier.into();

        if embedding.variant != self.variant {
            return Err(CacheError::VariantMismatch {
                expected: self.variant.clone(),
                found: embedding.variant,
            });
        }
        if let Some(dim) = self.dim() {
            if embedding.dim() != dim {
                return Err(CacheError::DimensionMismatch {
                    identifier,
                    expected: dim,
                    found: embedding.dim(),
                });
            }
        }

        match self.entries.iter_mut().find(|e| e.identifier == identifier) {
            Some(existing) => existing.embedding = embedding,
            None => self.entries.push(CacheEntry { identifier, embedding }),
        }
        Ok(())
    }

    /// Serialize to the blob format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        let file = CacheFile {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            variant: self.variant.clone(),
            dim: self.dim().unwrap_or(0) as u32,
            entries: self
                .entries
                .iter()
                .map(|e| StoredEntry {
                    identifier: e.identifier.clone(),
                    values: e.embedding.values.clone(),
                })
                .collect(),
        };

        let mut buf = bincode::serialize(&file)?;
        let digest = Sha256::digest(&buf);
        buf.extend_from_slice(&digest);
        Ok(buf)
    }

    /// Parse the blob format, verifying the checksum first.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        if bytes.is_empty() {
            return Err(CacheError::Empty);
        }
        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(CacheError::BadMagic);
        }
        if bytes.len() < MAGIC.len() + CHECKSUM_LEN {
            return Err(CacheError::Truncated);
        }

        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(CacheError::ChecksumMismatch);
        }

        let header: CacheHeader = bincode::deserialize(body)?;
        if header.version != FORMAT_VERSION {
            return Err(CacheError::UnsupportedVersion(header.version));
        }

        let file: CacheFile = bincode::deserialize(body)?;
        let used = bincode::serialized_size(&file)?;
        if used != body.len() as u64 {
            return Err(CacheError::TrailingBytes((body.len() as u64).saturating_sub(used)));
        }

        let dim = file.dim as usize;
        let mut cache = EmbeddingCache::new(file.variant);
        for stored in file.entries {
            if stored.values.len() != dim {
                return Err(CacheError::DimensionMismatch {
                    identifier: stored.identifier,
                    expected: dim,
                    found: stored.values.len(),
                });
            }
            let embedding = Embedding::new(stored.values, cache.variant.clone());
            cache.insert(stored.identifier, embedding)?;
        }
        Ok(cache)
    }

    /// Write the cache to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let part = part_path(path);
        std::fs::write(&part, self.to_bytes()?)?;
        std::fs::rename(&part, path)?;
        tracing::info!(path = %path.display(), entries = self.len(), variant = %self.variant, "embedding cache saved");
        Ok(())
    }

    /// Read a cache from `path`.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Read a cache for `variant`, falling back to an empty cache.
    ///
    /// A missing, empty, unreadable, or other-variant cache is logged as a
    /// warning: matching is disabled but monitoring still runs.
    pub fn load_or_empty(path: &Path, variant: &str) -> Self {
        let cache = match Self::load(path) {
            Ok(cache) => cache,
            Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    "embedding cache not found; running without match capability (run `callwatch precompute`)"
                );
                return Self::new(variant);
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "embedding cache unusable; running without match capability"
                );
                return Self::new(variant);
            }
        };

        if cache.variant != variant {
            tracing::warn!(
                path = %path.display(),
                cache_variant = %cache.variant,
                configured_variant = variant,
                "embedding cache was built with a different embedder variant; ignoring it"
            );
            return Self::new(variant);
        }

        if cache.is_empty() {
            tracing::warn!(path = %path.display(), "embedding cache is empty; no registry entries can match");
        } else {
            tracing::info!(path = %path.display(), entries = cache.len(), variant, "embedding cache loaded");
        }
        cache
    }
}

/// Summary of an offline cache build.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub embedded: usize,
    /// Entries whose photo had no detectable face.
    pub no_face: Vec<String>,
    /// Entries whose embedding failed, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Build a cache for `variant` from registry `entries`.
///
/// The first detected face of each photo is embedded. Photos with no face are
/// handled per `policy`. A variant that cannot be loaded aborts the build;
/// per-photo inference failures are recorded and skipped.
pub fn build_cache<M>(
    entries: &[RegistryEntry],
    models: &M,
    variant: &str,
    policy: MissingFacePolicy,
) -> Result<(EmbeddingCache, BuildReport), CacheError>
where
    M: FaceDetector + FaceEmbedder + ?Sized,
{
    let mut cache = EmbeddingCache::new(variant);
    let mut report = BuildReport::default();

    tracing::info!(entries = entries.len(), variant, "building embedding cache");

    for entry in entries {
        let faces = models.detect_path(&entry.source_image_path);
        let Some(face) = faces.first() else {
            match policy {
                MissingFacePolicy::Skip => {
                    tracing::debug!(identifier = %entry.identifier, "no face in registry photo; skipped");
                }
                MissingFacePolicy::Warn => {
                    tracing::warn!(
                        identifier = %entry.identifier,
                        path = %entry.source_image_path.display(),
                        "no face in registry photo; entry will never match"
                    );
                }
                MissingFacePolicy::Fail => return Err(CacheError::NoFace(entry.identifier.clone())),
            }
            report.no_face.push(entry.identifier.clone());
            continue;
        };

        if faces.len() > 1 {
            tracing::debug!(identifier = %entry.identifier, faces = faces.len(), "several faces in registry photo; using the first");
        }

        match models.embed(face, variant) {
            Ok(embedding) => {
                cache.insert(entry.identifier.clone(), embedding)?;
                report.embedded += 1;
            }
            Err(e) if e.is_model_unusable() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(identifier = %entry.identifier, error = %e, "embedding failed; skipped");
                report.failed.push((entry.identifier.clone(), e.to_string()));
            }
        }
    }

    tracing::info!(
        embedded = report.embedded,
        no_face = report.no_face.len(),
        failed = report.failed.len(),
        "embedding cache built"
    );
    Ok((cache, report))
}

fn part_path(path: &Path) -> PathBuf {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FaceCrop, PixelRect};
    use image::{Rgb, RgbImage};
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), "edgeface_xxs")
    }

    fn sample_cache() -> EmbeddingCache {
        let mut cache = EmbeddingCache::new("edgeface_xxs");
        cache.insert("alice", emb(&[0.6, 0.8, 0.0])).unwrap();
        cache.insert("bob", emb(&[-0.0, f32::MIN_POSITIVE, 1.0e-7])).unwrap();
        cache.insert("Zo~C3~ABe_Rivera", emb(&[0.1, 0.2, 0.3])).unwrap();
        cache
    }

    #[test]
    fn test_round_trip_is_bit_identical() {
        let cache = sample_cache();
        let decoded = EmbeddingCache::from_bytes(&cache.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.variant(), "edgeface_xxs");
        assert_eq!(decoded.len(), cache.len());
        for (a, b) in cache.entries().iter().zip(decoded.entries()) {
            assert_eq!(a.identifier, b.identifier);
            let bits_a: Vec<u32> = a.embedding.values.iter().map(|v| v.to_bits()).collect();
            let bits_b: Vec<u32> = b.embedding.values.iter().map(|v| v.to_bits()).collect();
            assert_eq!(bits_a, bits_b);
        }
    }

    #[test]
    fn test_round_trip_empty_cache() {
        let cache = EmbeddingCache::new("w600k_r50");
        let decoded = EmbeddingCache::from_bytes(&cache.to_bytes().unwrap()).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.variant(), "w600k_r50");
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/embeddings.bin");
        let cache = sample_cache();

        cache.save(&path).unwrap();
        assert_eq!(EmbeddingCache::load(&path).unwrap(), cache);
        assert!(!part_path(&path).exists());
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = sample_cache().to_bytes().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        assert!(matches!(EmbeddingCache::from_bytes(&bytes), Err(CacheError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncation_and_garbage_rejected() {
        let bytes = sample_cache().to_bytes().unwrap();
        assert!(EmbeddingCache::from_bytes(&bytes[..bytes.len() - 5]).is_err());
        assert!(matches!(EmbeddingCache::from_bytes(b"PKL\x80junk"), Err(CacheError::BadMagic)));
        assert!(matches!(EmbeddingCache::from_bytes(&[]), Err(CacheError::Empty)));
    }

    fn seal(file: &CacheFile) -> Vec<u8> {
        let mut bytes = bincode::serialize(file).unwrap();
        let digest = Sha256::digest(&bytes);
        bytes.extend_from_slice(&digest);
        bytes
    }

    #[test]
    fn test_blob_starts_with_magic_and_version() {
        let bytes = sample_cache().to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"CWEC");
        assert_eq!(&bytes[4..8], &FORMAT_VERSION.to_le_bytes());
    }

    #[test]
    fn test_future_version_rejected() {
        let bytes = seal(&CacheFile {
            magic: *MAGIC,
            version: 2,
            variant: "edgeface_xxs".into(),
            dim: 0,
            entries: Vec::new(),
        });
        assert!(matches!(EmbeddingCache::from_bytes(&bytes), Err(CacheError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_entry_dimension_must_match_header() {
        let bytes = seal(&CacheFile {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            variant: "edgeface_xxs".into(),
            dim: 3,
            entries: vec![StoredEntry {
                identifier: "alice".into(),
                values: vec![1.0, 0.0],
            }],
        });
        let err = EmbeddingCache::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, CacheError::DimensionMismatch { expected: 3, found: 2, .. }), "{err:?}");
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut body = bincode::serialize(&CacheFile {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            variant: "edgeface_xxs".into(),
            dim: 0,
            entries: Vec::new(),
        })
        .unwrap();
        body.extend_from_slice(b"xx");
        let digest = Sha256::digest(&body);
        body.extend_from_slice(&digest);
        assert!(matches!(EmbeddingCache::from_bytes(&body), Err(CacheError::TrailingBytes(2))));
    }

    #[test]
    fn test_insert_rejects_mixed_variants_and_dims() {
        let mut cache = EmbeddingCache::new("edgeface_xxs");
        cache.insert("a", emb(&[1.0, 0.0])).unwrap();

        let other = Embedding::new(vec![1.0, 0.0], "w600k_r50");
        assert!(matches!(cache.insert("b", other), Err(CacheError::VariantMismatch { .. })));
        assert!(matches!(cache.insert("c", emb(&[1.0])), Err(CacheError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut cache = sample_cache();
        cache.insert("alice", emb(&[0.0, 0.0, 1.0])).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.entries()[0].identifier, "alice");
        assert_eq!(cache.get("alice").unwrap().values, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_load_or_empty_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::load_or_empty(&dir.path().join("absent.bin"), "edgeface_xxs");
        assert!(cache.is_empty());
        assert_eq!(cache.variant(), "edgeface_xxs");
    }

    #[test]
    fn test_load_or_empty_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        std::fs::write(&path, b"").unwrap();
        assert!(EmbeddingCache::load_or_empty(&path, "edgeface_xxs").is_empty());
    }

    #[test]
    fn test_load_or_empty_wrong_variant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        sample_cache().save(&path).unwrap();

        assert_eq!(EmbeddingCache::load_or_empty(&path, "edgeface_xxs").len(), 3);
        let other = EmbeddingCache::load_or_empty(&path, "w600k_r50");
        assert!(other.is_empty());
        assert_eq!(other.variant(), "w600k_r50");
    }

    /// Detector/embedder double keyed by file stem: stems listed in `faces`
    /// yield one face whose embedding is the listed vector.
    struct StubModels {
        faces: HashMap<String, Vec<f32>>,
        last_stem: RefCell<String>,
    }

    impl StubModels {
        fn new(faces: &[(&str, Vec<f32>)]) -> Self {
            Self {
                faces: faces.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                last_stem: RefCell::new(String::new()),
            }
        }
    }

    impl FaceDetector for StubModels {
        fn detect(&self, _image: &RgbImage) -> Vec<FaceCrop> {
            Vec::new()
        }

        fn detect_path(&self, path: &Path) -> Vec<FaceCrop> {
            let stem = path.file_stem().unwrap().to_string_lossy().to_string();
            if !self.faces.contains_key(&stem) {
                return Vec::new();
            }
            *self.last_stem.borrow_mut() = stem;
            vec![FaceCrop {
                image: RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])),
                rect: PixelRect { x: 0, y: 0, width: 8, height: 8 },
                confidence: 0.99,
            }]
        }
    }

    impl FaceEmbedder for StubModels {
        fn embed(&self, _face: &FaceCrop, variant: &str) -> Result<Embedding, EmbedError> {
            let stem = self.last_stem.borrow();
            let values = self
                .faces
                .get(stem.as_str())
                .cloned()
                .ok_or_else(|| EmbedError::InferenceFailed("unknown face".into()))?;
            Ok(Embedding::new(values, variant))
        }
    }

    fn entry(identifier: &str) -> RegistryEntry {
        RegistryEntry {
            identifier: identifier.to_string(),
            source_image_path: PathBuf::from(format!("/registry/{identifier}.jpg")),
            metadata: None,
        }
    }

    #[test]
    fn test_build_skips_photos_without_faces() {
        let models = StubModels::new(&[("alice", vec![1.0, 0.0]), ("carol_b", vec![0.0, 1.0])]);
        let entries = vec![entry("alice"), entry("bob"), entry("carol_b")];

        let (cache, report) = build_cache(&entries, &models, "edgeface_xxs", MissingFacePolicy::Warn).unwrap();

        assert_eq!(report.embedded, 2);
        assert_eq!(report.no_face, vec!["bob".to_string()]);
        let ids: Vec<&str> = cache.entries().iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["alice", "carol_b"]);
        assert!(cache.get("bob").is_none());
    }

    #[test]
    fn test_build_fail_policy_aborts() {
        let models = StubModels::new(&[]);
        let err = build_cache(&[entry("ghost")], &models, "edgeface_xxs", MissingFacePolicy::Fail).unwrap_err();
        assert!(matches!(err, CacheError::NoFace(id) if id == "ghost"));
    }
}
