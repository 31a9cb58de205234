//! callwatch-core: Face detection, embedding and registry matching.
//!
//! Uses SCRFD for face detection and a family of 112×112 embedder models
//! (EdgeFace, ArcFace, HyperFace), all running via ONNX Runtime on the CPU.

pub mod cache;
pub mod config;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod models;
pub mod registry;
pub mod types;

pub use cache::{build_cache, EmbeddingCache, MissingFacePolicy};
pub use config::{BackendKind, Config};
pub use detector::FaceDetector;
pub use embedder::{EmbedError, FaceEmbedder};
pub use matcher::{find_match, MatchEngine, MatchPolicy, MatchResult};
pub use models::ModelRegistry;
pub use registry::{Registry, RegistryEntry};
pub use types::{BoundingBox, Embedding, FaceCrop, PixelRect};
