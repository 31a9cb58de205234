use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face in source-image pixel space, with optional
/// facial landmarks. Coordinates may fall outside the image until clamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with `other`; 0 when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let overlap_w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let overlap_h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        let intersection = overlap_w.max(0.0) * overlap_h.max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Clamp the box to a `width` × `height` image.
    ///
    /// Returns `None` when nothing of the box is left inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelRect> {
        if !(self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite())
        {
            return None;
        }

        let x1 = self.x.floor().clamp(0.0, width as f32) as u32;
        let y1 = self.y.floor().clamp(0.0, height as f32) as u32;
        let x2 = (self.x + self.width).ceil().clamp(0.0, width as f32) as u32;
        let y2 = (self.y + self.height).ceil().clamp(0.0, height as f32) as u32;

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(PixelRect {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }
}

/// Integer rectangle that lies fully inside its source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A face cut out of a larger image. Same pixel layout as the source.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub image: RgbImage,
    /// Where the crop came from in the source image.
    pub rect: PixelRect,
    pub confidence: f32,
}

/// Face embedding vector, tagged with the embedder variant that produced it.
///
/// Embeddings are only comparable within one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub variant: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, variant: impl Into<String>) -> Self {
        Self {
            values,
            variant: variant.into(),
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Zero vectors compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine similarity as a percentage, clamped to [0, 100].
    ///
    /// Negative similarity reads as 0%. Rounding can push the raw cosine a
    /// hair past ±1, hence the clamp. Non-finite input reads as 0%.
    pub fn similarity_percent(&self, other: &Embedding) -> f32 {
        let pct = self.similarity(other) * 100.0;
        if pct.is_finite() {
            pct.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }

    /// Scale to unit length. Zero vectors are left as is.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }
}
