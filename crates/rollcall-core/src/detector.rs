//! Person detection via a YOLOv5-class ONNX model.
//!
//! The model is consumed as a black box: one inference call per image,
//! returning labelled, scored bounding boxes. This module only does the
//! integration plumbing — letterbox preprocessing, output-grid decoding,
//! and NMS — and leaves the person/score filtering to the caller.

use crate::types::DetectionBox;
use image::{imageops, imageops::FilterType, RgbaImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const YOLO_INPUT_SIZE: usize = 640;
/// Per-row box attributes ahead of the class scores: cx, cy, w, h, objectness.
const YOLO_BOX_ATTRS: usize = 5;
/// Rows below this combined score are dropped before NMS.
const YOLO_PREFILTER_THRESHOLD: f32 = 0.25;
const YOLO_NMS_THRESHOLD: f32 = 0.45;
/// Letterbox padding, the conventional YOLO gray (114/255).
const YOLO_PAD_VALUE: f32 = 114.0 / 255.0;

/// Label the caller filters on when looking for a face candidate.
pub const PERSON_LABEL: &str = "person";
/// Detections at or below this score do not qualify as a person.
pub const PERSON_SCORE_THRESHOLD: f32 = 0.5;

/// COCO class labels in model output order.
const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — place a YOLOv5-class ONNX export in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// One inference call per image. Expensive to construct (model load),
/// cheap to reuse; callers hold a single instance per session.
pub trait RegionDetector {
    fn detect(&mut self, image: &RgbaImage) -> Result<Vec<DetectionBox>, DetectorError>;
}

/// YOLOv5-class object detector backed by ONNX Runtime.
pub struct OnnxDetector {
    session: Session,
}

impl OnnxDetector {
    /// Load the detection model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(|e| -> ort::Error { e.into() })?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name().to_string()).collect::<Vec<_>>(),
            "loaded detection model"
        );

        Ok(Self { session })
    }

    /// Letterbox the image into the model's square input and normalize
    /// pixel bytes to [0, 1] NCHW floats. Alpha is dropped.
    fn preprocess(image: &RgbaImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = image.dimensions();

        let scale_w = YOLO_INPUT_SIZE as f32 / width as f32;
        let scale_h = YOLO_INPUT_SIZE as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        let new_w = ((width as f32 * scale).round() as u32).max(1);
        let new_h = ((height as f32 * scale).round() as u32).max(1);
        let pad_x = (YOLO_INPUT_SIZE as u32 - new_w) / 2;
        let pad_y = (YOLO_INPUT_SIZE as u32 - new_h) / 2;

        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let mut tensor = Array4::<f32>::from_elem(
            (1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE),
            YOLO_PAD_VALUE,
        );
        for (x, y, pixel) in resized.enumerate_pixels() {
            let tx = (x + pad_x) as usize;
            let ty = (y + pad_y) as usize;
            tensor[[0, 0, ty, tx]] = pixel.0[0] as f32 / 255.0;
            tensor[[0, 1, ty, tx]] = pixel.0[1] as f32 / 255.0;
            tensor[[0, 2, ty, tx]] = pixel.0[2] as f32 / 255.0;
        }

        let letterbox = LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        };

        (tensor, letterbox)
    }
}

impl RegionDetector for OnnxDetector {
    /// Run one inference pass, returning detections sorted by score.
    fn detect(&mut self, image: &RgbaImage) -> Result<Vec<DetectionBox>, DetectorError> {
        let (width, height) = image.dimensions();
        let (input, letterbox) = Self::preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detection output: {e}")))?;

        let candidates = decode_output(raw, &letterbox, width, height, YOLO_PREFILTER_THRESHOLD)?;

        let mut result = nms(candidates, YOLO_NMS_THRESHOLD);
        result.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::debug!(detections = result.len(), "inference complete");
        Ok(result)
    }
}

/// Filter detections down to persons whose score strictly exceeds the
/// threshold. An empty result means "no face candidate in frame" and
/// the recognition attempt must stop before feature extraction.
pub fn qualifying_people(detections: &[DetectionBox], threshold: f32) -> Vec<DetectionBox> {
    detections
        .iter()
        .filter(|d| d.label == PERSON_LABEL && d.score > threshold)
        .cloned()
        .collect()
}

/// Decode the flat YOLO output into image-space boxes.
///
/// Layout per row: [cx, cy, w, h, objectness, class scores...], all in
/// letterboxed input coordinates. Combined score = objectness × best
/// class score; rows at or below `prefilter` are dropped.
fn decode_output(
    raw: &[f32],
    letterbox: &LetterboxInfo,
    orig_width: u32,
    orig_height: u32,
    prefilter: f32,
) -> Result<Vec<DetectionBox>, DetectorError> {
    let attrs = YOLO_BOX_ATTRS + COCO_LABELS.len();
    if raw.is_empty() || raw.len() % attrs != 0 {
        return Err(DetectorError::InferenceFailed(format!(
            "output length {} is not a multiple of {attrs}",
            raw.len()
        )));
    }

    let mut detections = Vec::new();

    for row in raw.chunks_exact(attrs) {
        let objectness = row[4];
        if objectness <= prefilter {
            continue;
        }

        let (best_class, best_class_score) = row[YOLO_BOX_ATTRS..]
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |acc, (i, &s)| {
                if s > acc.1 {
                    (i, s)
                } else {
                    acc
                }
            });

        let score = objectness * best_class_score;
        if score <= prefilter {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);

        // Letterboxed space → original frame space, clamped to the image.
        let xmin = ((cx - w / 2.0 - letterbox.pad_x) / letterbox.scale)
            .clamp(0.0, orig_width as f32);
        let ymin = ((cy - h / 2.0 - letterbox.pad_y) / letterbox.scale)
            .clamp(0.0, orig_height as f32);
        let xmax = ((cx + w / 2.0 - letterbox.pad_x) / letterbox.scale)
            .clamp(0.0, orig_width as f32);
        let ymax = ((cy + h / 2.0 - letterbox.pad_y) / letterbox.scale)
            .clamp(0.0, orig_height as f32);

        if xmax <= xmin || ymax <= ymin {
            continue;
        }

        detections.push(DetectionBox {
            xmin,
            ymin,
            xmax,
            ymax,
            label: COCO_LABELS[best_class].to_string(),
            score,
        });
    }

    Ok(detections)
}

/// Non-Maximum Suppression: remove overlapping same-label detections.
fn nms(mut detections: Vec<DetectionBox>, iou_threshold: f32) -> Vec<DetectionBox> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] || detections[i].label != detections[j].label {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two boxes.
fn iou(a: &DetectionBox, b: &DetectionBox) -> f32 {
    let x1 = a.xmin.max(b.xmin);
    let y1 = a.ymin.max(b.ymin);
    let x2 = a.xmax.min(b.xmax);
    let y2 = a.ymax.min(b.ymax);

    let inter_w = (x2 - x1).max(0.0);
    let inter_h = (y2 - y1).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = a.width() * a.height();
    let area_b = b.width() * b.height();
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
