//! Face embedder via ONNX Runtime.
//!
//! Turns a face crop into a fixed-length embedding. Each embedder variant is a
//! separate ONNX model with its own input layout; [`preprocess`] is the single
//! place that layout is applied, for registry photos and live faces alike.

use crate::types::{Embedding, FaceCrop};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5; // symmetric: maps [0, 255] onto [-1, 1]

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("unknown embedder variant: {0}")]
    UnknownVariant(String),
    #[error("embedder model unavailable for {variant}: {reason}")]
    Unavailable { variant: String, reason: String },
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl EmbedError {
    /// True when no face can be embedded with this variant right now, as
    /// opposed to one crop failing inference.
    pub fn is_model_unusable(&self) -> bool {
        matches!(
            self,
            EmbedError::UnknownVariant(_) | EmbedError::Unavailable { .. } | EmbedError::ModelNotFound(_)
        )
    }
}

/// Anything that can embed a face crop with a named variant.
pub trait FaceEmbedder {
    fn embed(&self, face: &FaceCrop, variant: &str) -> Result<Embedding, EmbedError>;
}

/// Channel order the model was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Static description of an embedder variant.
#[derive(Debug, Clone, Copy)]
pub struct VariantSpec {
    pub name: &'static str,
    pub input_size: u32,
    pub dim: usize,
    pub channel_order: ChannelOrder,
}

impl VariantSpec {
    /// Weights file name inside the model directory.
    pub fn file_name(&self) -> String {
        format!("{}.onnx", self.name)
    }
}

const fn variant(name: &'static str, channel_order: ChannelOrder) -> VariantSpec {
    VariantSpec {
        name,
        input_size: 112,
        dim: 512,
        channel_order,
    }
}

/// Every embedder variant this build knows how to feed.
pub const VARIANTS: &[VariantSpec] = &[
    variant("edgeface_base", ChannelOrder::Rgb),
    variant("edgeface_s_gamma_05", ChannelOrder::Rgb),
    variant("edgeface_xs_gamma_06", ChannelOrder::Rgb),
    variant("edgeface_xxs", ChannelOrder::Rgb),
    variant("w600k_r50", ChannelOrder::Rgb),
    variant("hyperface_10k_ldm", ChannelOrder::Bgr),
    variant("hyperface_10k_stylegan", ChannelOrder::Bgr),
    variant("hyperface_50k_stylegan", ChannelOrder::Bgr),
];

/// Look up a variant by name.
pub fn variant_spec(name: &str) -> Result<&'static VariantSpec, EmbedError> {
    VARIANTS
        .iter()
        .find(|v| v.name == name)
        .ok_or_else(|| EmbedError::UnknownVariant(name.to_string()))
}

/// One loaded embedder model.
pub struct OnnxEmbedder {
    session: Session,
    spec: &'static VariantSpec,
}

impl OnnxEmbedder {
    /// Load the ONNX model for `spec` from `model_path`.
    pub fn load(model_path: &Path, spec: &'static VariantSpec) -> Result<Self, EmbedError> {
        if !model_path.exists() {
            return Err(EmbedError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            variant = spec.name,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedder model"
        );

        Ok(Self { session, spec })
    }

    pub fn spec(&self) -> &'static VariantSpec {
        self.spec
    }

    /// Extract an L2-normalized embedding from a face crop.
    pub fn extract(&mut self, face: &FaceCrop) -> Result<Embedding, EmbedError> {
        let input = preprocess(face, self.spec);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != self.spec.dim {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {}-dim embedding from {}, got {}",
                self.spec.dim,
                self.spec.name,
                raw_data.len()
            )));
        }

        Ok(Embedding::new(raw_data.to_vec(), self.spec.name).l2_normalized())
    }
}

/// Resize a face crop to the variant's input size and lay it out as a NCHW
/// float tensor scaled to [-1, 1], in the variant's channel order.
pub fn preprocess(face: &FaceCrop, spec: &VariantSpec) -> Array4<f32> {
    let size = spec.input_size;
    let resized = imageops::resize(&face.image, size, size, FilterType::Triangle);
    let size = size as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let ordered = match spec.channel_order {
            ChannelOrder::Rgb => [r, g, b],
            ChannelOrder::Bgr => [b, g, r],
        };
        for (c, value) in ordered.iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = (*value as f32 - EMBED_MEAN) / EMBED_STD;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelRect;
    use image::{Rgb, RgbImage};

    fn crop(width: u32, height: u32, color: [u8; 3]) -> FaceCrop {
        FaceCrop {
            image: RgbImage::from_pixel(width, height, Rgb(color)),
            rect: PixelRect { x: 0, y: 0, width, height },
            confidence: 1.0,
        }
    }

    #[test]
    fn test_variant_lookup() {
        let spec = variant_spec("edgeface_s_gamma_05").unwrap();
        assert_eq!(spec.dim, 512);
        assert_eq!(spec.file_name(), "edgeface_s_gamma_05.onnx");
        assert!(matches!(variant_spec("nope"), Err(EmbedError::UnknownVariant(_))));
        assert!(EmbedError::UnknownVariant("nope".into()).is_model_unusable());
        assert!(!EmbedError::InferenceFailed("nan".into()).is_model_unusable());
    }

    #[test]
    fn test_variant_names_unique() {
        for (i, a) in VARIANTS.iter().enumerate() {
            for b in &VARIANTS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_preprocess_output_shape_any_crop_size() {
        let spec = variant_spec("edgeface_xxs").unwrap();
        for (w, h) in [(37, 53), (112, 112), (400, 300)] {
            let tensor = preprocess(&crop(w, h, [128, 128, 128]), spec);
            assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        }
    }

    #[test]
    fn test_preprocess_normalization_range() {
        let spec = variant_spec("edgeface_base").unwrap();
        let white = preprocess(&crop(20, 20, [255, 255, 255]), spec);
        let black = preprocess(&crop(20, 20, [0, 0, 0]), spec);
        assert!((white[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
        assert!((black[[0, 2, 10, 10]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_channel_order() {
        let face = crop(16, 16, [255, 0, 0]);

        let rgb = preprocess(&face, variant_spec("w600k_r50").unwrap());
        assert!((rgb[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((rgb[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);

        let bgr = preprocess(&face, variant_spec("hyperface_10k_ldm").unwrap());
        assert!((bgr[[0, 0, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((bgr[[0, 2, 5, 5]] - 1.0).abs() < 1e-6);
    }
}
