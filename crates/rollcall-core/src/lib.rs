//! rollcall-core — Person detection and face matching engine.
//!
//! Uses a YOLOv5-class object-detection model via ONNX Runtime to find
//! people in a frame, then compares raw-pixel feature vectors with
//! cosine similarity. The feature heuristic deliberately fingerprints a
//! crop rather than embedding a face; see [`features`].

pub mod detector;
pub mod features;
pub mod types;

pub use detector::{OnnxDetector, RegionDetector, PERSON_LABEL, PERSON_SCORE_THRESHOLD};
pub use features::{FeatureExtractor, PixelSliceExtractor, FEATURE_LEN};
pub use types::{DetectionBox, Enrollment, FeatureVector, FirstMatchMatcher, MatchHit, Matcher};
