//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free SCRFD decoding over three strides with greedy suppression of
//! overlapping boxes, plus the cropping step that turns detections into
//! [`FaceCrop`]s.

use crate::types::{BoundingBox, FaceCrop};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can find faces in an image.
///
/// "No face" is a routine outcome, so implementations return an empty list
/// rather than an error, including when the input or the model is unusable.
pub trait FaceDetector {
    /// Faces in `image`, highest confidence first.
    fn detect(&self, image: &RgbImage) -> Vec<FaceCrop>;

    /// Decode the image at `path` and detect faces in it.
    fn detect_path(&self, path: &Path) -> Vec<FaceCrop> {
        match image::open(path) {
            Ok(img) => self.detect(&img.to_rgb8()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not decode image; treating as no faces");
                Vec::new()
            }
        }
    }
}

/// How a source image was fitted into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    /// Model-input coordinates back to source-image coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Which session output holds the scores, box distances and keypoints of
/// each stride, in [`STRIDES`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputLayout {
    score: [usize; 3],
    bbox: [usize; 3],
    kps: [usize; 3],
}

impl OutputLayout {
    /// Exports either name outputs `score_8`, `bbox_16`, `kps_32`, ... or
    /// leave them numbered; numbered exports group scores, then boxes, then
    /// keypoints.
    fn from_names(names: &[String]) -> Self {
        let index_of = |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));
        let by_name = |kind: &str| -> Option<[usize; 3]> {
            Some([index_of(kind, 8)?, index_of(kind, 16)?, index_of(kind, 32)?])
        };

        match (by_name("score"), by_name("bbox"), by_name("kps")) {
            (Some(score), Some(bbox), Some(kps)) => Self { score, bbox, kps },
            _ => {
                tracing::debug!(?names, "SCRFD outputs are unnamed; assuming grouped order");
                Self {
                    score: [0, 1, 2],
                    bbox: [3, 4, 5],
                    kps: [6, 7, 8],
                }
            }
        }
    }
}

/// Raw outputs for one stride.
struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    layout: OutputLayout,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected 9 SCRFD outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let layout = OutputLayout::from_names(&names);

        tracing::info!(path = %model_path.display(), outputs = ?names, ?layout, "loaded face detector");
        Ok(Self { session, layout })
    }

    /// Face boxes in source-image coordinates, highest confidence first.
    pub fn detect_boxes(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, fit) = letterbox(image, INPUT_SIZE);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let extract = |idx: usize, what: &str, stride: usize| {
            outputs[idx]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} for stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let tensors = StrideTensors {
                scores: extract(self.layout.score[slot], "scores", stride)?,
                bboxes: extract(self.layout.bbox[slot], "boxes", stride)?,
                kps: extract(self.layout.kps[slot], "keypoints", stride)?,
            };
            let grid = INPUT_SIZE / stride;
            candidates.extend(decode_stride(&tensors, stride, (grid, grid), &fit, SCORE_THRESHOLD));
        }

        Ok(suppress_overlaps(candidates, IOU_THRESHOLD))
    }
}

/// Cut detected faces out of `image`.
///
/// Boxes are clamped to the image; boxes with no area left are dropped.
/// Input order is preserved.
pub fn crop_faces(image: &RgbImage, boxes: &[BoundingBox]) -> Vec<FaceCrop> {
    boxes
        .iter()
        .filter_map(|bbox| {
            let Some(rect) = bbox.clamp_to(image.width(), image.height()) else {
                tracing::trace!(?bbox, "dropping degenerate face box");
                return None;
            };
            let crop = imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
            Some(FaceCrop {
                image: crop,
                rect,
                confidence: bbox.confidence,
            })
        })
        .collect()
}

/// Scale `image` to fit a `size` × `size` input, centre it, and normalize.
///
/// Padding is left at zero, which is what the mean colour normalizes to.
fn letterbox(image: &RgbImage, size: usize) -> (Array4<f32>, Letterbox) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let scale = (size as f32 / w).min(size as f32 / h);

    let new_w = ((w * scale).round() as usize).clamp(1, size);
    let new_h = ((h * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;
    let (off_x, off_y) = (pad_x.floor() as usize, pad_y.floor() as usize);

    let resized = imageops::resize(image, new_w as u32, new_h as u32, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, y as usize + off_y, x as usize + off_x]] = (value as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Turn one stride's raw outputs into source-space boxes above `threshold`.
///
/// Each grid cell carries [`ANCHORS_PER_CELL`] anchors at the cell's top-left
/// corner; box outputs are edge distances and keypoints are offsets, both in
/// stride units.
fn decode_stride(
    t: &StrideTensors<'_>,
    stride: usize,
    (grid_w, grid_h): (usize, usize),
    fit: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let step = stride as f32;
    let anchors = grid_w * grid_h * ANCHORS_PER_CELL;

    (0..anchors.min(t.scores.len()))
        .filter(|&i| t.scores[i] > threshold)
        .filter_map(|i| {
            let edges = t.bboxes.get(i * 4..i * 4 + 4)?;
            let cell = i / ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            let (x1, y1) = fit.unmap(cx - edges[0] * step, cy - edges[1] * step);
            let (x2, y2) = fit.unmap(cx + edges[2] * step, cy + edges[3] * step);

            let landmarks = t.kps.get(i * 10..i * 10 + 10).map(|k| {
                let mut points = [(0.0f32, 0.0f32); 5];
                for (p, pair) in points.iter_mut().zip(k.chunks_exact(2)) {
                    *p = fit.unmap(cx + pair[0] * step, cy + pair[1] * step);
                }
                points
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: t.scores[i],
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Returns survivors by descending confidence.
fn suppress_overlaps(mut boxes: Vec<BoundingBox>, max_iou: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}
