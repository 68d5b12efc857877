//! Raw-pixel feature extraction.
//!
//! The "features" here are the first 128 raw RGBA bytes of the cropped
//! region, in buffer order. That makes the vector a position-and-size
//! sensitive fingerprint of the crop: deterministic for identical input,
//! but not invariant to lighting, pose, or resolution. Changing this
//! scheme invalidates every stored vector, so the exact semantics are
//! load-bearing.

use crate::types::{DetectionBox, FeatureVector};
use image::{imageops, RgbaImage};
use thiserror::Error;

/// Number of raw bytes taken from the crop buffer.
pub const FEATURE_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("source image has no pixels")]
    EmptyImage,
    #[error("crop region is empty: ({xmin}, {ymin})..({xmax}, {ymax}) in {width}x{height} image")]
    EmptyCrop {
        xmin: f32,
        ymin: f32,
        xmax: f32,
        ymax: f32,
        width: u32,
        height: u32,
    },
}

/// Anything that can turn an image region into a numeric vector.
///
/// Single-method seam so the pixel-slice heuristic can be swapped for a
/// real embedding model without touching orchestration. Passing no
/// region means "use the whole image".
pub trait FeatureExtractor {
    fn extract(
        &self,
        image: &RgbaImage,
        region: Option<&DetectionBox>,
    ) -> Result<FeatureVector, ExtractionError>;
}

/// The production extractor: crop, read back raw RGBA bytes, keep the
/// first [`FEATURE_LEN`] of them as integer magnitudes 0–255.
///
/// A crop smaller than 32 pixels yields fewer than 128 bytes; the
/// vector keeps the shorter length and the comparator's length rule
/// makes it unmatchable against full-length stored vectors.
pub struct PixelSliceExtractor;

impl FeatureExtractor for PixelSliceExtractor {
    fn extract(
        &self,
        image: &RgbaImage,
        region: Option<&DetectionBox>,
    ) -> Result<FeatureVector, ExtractionError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(ExtractionError::EmptyImage);
        }

        let (x0, y0, crop_w, crop_h) = match region {
            Some(b) => {
                // Clamp to image bounds; a box entirely outside the
                // image degenerates to an empty crop.
                let x0 = (b.xmin.round().max(0.0) as u32).min(width);
                let y0 = (b.ymin.round().max(0.0) as u32).min(height);
                let x1 = (b.xmax.round().max(0.0) as u32).min(width);
                let y1 = (b.ymax.round().max(0.0) as u32).min(height);
                let crop_w = x1.saturating_sub(x0);
                let crop_h = y1.saturating_sub(y0);
                if crop_w == 0 || crop_h == 0 {
                    return Err(ExtractionError::EmptyCrop {
                        xmin: b.xmin,
                        ymin: b.ymin,
                        xmax: b.xmax,
                        ymax: b.ymax,
                        width,
                        height,
                    });
                }
                (x0, y0, crop_w, crop_h)
            }
            None => (0, 0, width, height),
        };

        let raw = imageops::crop_imm(image, x0, y0, crop_w, crop_h)
            .to_image()
            .into_raw();

        let take = raw.len().min(FEATURE_LEN);
        let values = raw[..take].iter().map(|&byte| byte as f32).collect();

        Ok(FeatureVector::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// Image whose pixel bytes encode their own position, so crops at
    /// different offsets produce different vectors.
    fn gradient_image(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        })
    }

    fn person_box(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> DetectionBox {
        DetectionBox {
            xmin,
            ymin,
            xmax,
            ymax,
            label: "person".into(),
            score: 0.9,
        }
    }

    #[test]
    fn test_extract_whole_image_length() {
        let img = gradient_image(64, 64);
        let v = PixelSliceExtractor.extract(&img, None).unwrap();
        assert_eq!(v.len(), FEATURE_LEN);
    }

    #[test]
    fn test_extract_is_deterministic() {
        let img = gradient_image(100, 80);
        let b = person_box(10.0, 10.0, 60.0, 70.0);
        let first = PixelSliceExtractor.extract(&img, Some(&b)).unwrap();
        let second = PixelSliceExtractor.extract(&img, Some(&b)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_extract_values_are_raw_bytes() {
        // A solid-color image should produce the color's byte pattern.
        let img = RgbaImage::from_pixel(32, 32, Rgba([7, 42, 99, 255]));
        let v = PixelSliceExtractor.extract(&img, None).unwrap();
        assert_eq!(&v.values[..4], &[7.0, 42.0, 99.0, 255.0]);
        assert_eq!(&v.values[4..8], &[7.0, 42.0, 99.0, 255.0]);
    }

    #[test]
    fn test_extract_crop_offset_changes_vector() {
        let img = gradient_image(100, 100);
        let a = PixelSliceExtractor
            .extract(&img, Some(&person_box(0.0, 0.0, 50.0, 50.0)))
            .unwrap();
        let b = PixelSliceExtractor
            .extract(&img, Some(&person_box(30.0, 30.0, 80.0, 80.0)))
            .unwrap();
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn test_extract_tiny_crop_is_short() {
        // 4x4 crop = 16 pixels = 64 RGBA bytes, under FEATURE_LEN.
        let img = gradient_image(64, 64);
        let v = PixelSliceExtractor
            .extract(&img, Some(&person_box(0.0, 0.0, 4.0, 4.0)))
            .unwrap();
        assert_eq!(v.len(), 64);
    }

    #[test]
    fn test_extract_box_clamped_to_image() {
        let img = gradient_image(40, 40);
        let v = PixelSliceExtractor
            .extract(&img, Some(&person_box(30.0, 30.0, 500.0, 500.0)))
            .unwrap();
        // Clamped to a 10x10 crop: 400 bytes, truncated to FEATURE_LEN.
        assert_eq!(v.len(), FEATURE_LEN);
    }

    #[test]
    fn test_extract_box_outside_image_fails() {
        let img = gradient_image(40, 40);
        let result = PixelSliceExtractor.extract(&img, Some(&person_box(100.0, 100.0, 200.0, 200.0)));
        assert!(matches!(result, Err(ExtractionError::EmptyCrop { .. })));
    }

    #[test]
    fn test_extract_inverted_box_fails() {
        let img = gradient_image(40, 40);
        let result = PixelSliceExtractor.extract(&img, Some(&person_box(30.0, 30.0, 10.0, 10.0)));
        assert!(matches!(result, Err(ExtractionError::EmptyCrop { .. })));
    }

    #[test]
    fn test_extract_empty_image_fails() {
        let img = RgbaImage::new(0, 0);
        let result = PixelSliceExtractor.extract(&img, None);
        assert!(matches!(result, Err(ExtractionError::EmptyImage)));
    }

    #[test]
    fn test_extract_matches_roundtrip() {
        // The vector extracted from the same crop twice must satisfy the
        // comparator at any threshold below 1.0.
        let img = gradient_image(64, 64);
        let b = person_box(8.0, 8.0, 56.0, 56.0);
        let a = PixelSliceExtractor.extract(&img, Some(&b)).unwrap();
        let c = PixelSliceExtractor.extract(&img, Some(&b)).unwrap();
        assert!(a.matches(&c, 0.8));
        assert!(a.matches(&c, 0.999));
    }
}
