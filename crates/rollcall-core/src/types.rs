use serde::{Deserialize, Serialize};

/// Axis-aligned region within an image, as returned by the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    /// Model label for the region (e.g., "person").
    pub label: String,
    /// Confidence score in [0, 1].
    pub score: f32,
}

impl DetectionBox {
    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }
}

/// Fixed-length feature vector derived from raw crop pixels.
///
/// Components hold raw byte magnitudes (0–255); no normalization is
/// applied. Two vectors are only comparable when their lengths match —
/// a mismatch usually means the stored vector came from an incompatible
/// extractor version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute cosine similarity between two vectors.
    ///
    /// Returns a value in [-1, 1]; 0.0 when either vector has zero norm.
    pub fn similarity(&self, other: &FeatureVector) -> f32 {
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

    /// Match decision: cosine similarity strictly above `threshold`.
    ///
    /// Empty or length-mismatched vectors never match. A zero-norm
    /// vector makes the similarity undefined; that case is pinned to
    /// "no match" instead of letting a NaN propagate.
    pub fn matches(&self, other: &FeatureVector, threshold: f32) -> bool {
        if self.values.is_empty() || self.values.len() != other.values.len() {
            return false;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom <= 0.0 {
            return false;
        }

        dot / denom > threshold
    }
}

/// A student as the matcher sees them: identity plus the stored
/// reference vector. `features` stays `None` until a photo with usable
/// features has been registered.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub student_id: String,
    pub name: String,
    pub features: Option<FeatureVector>,
}

/// Result of matching a probe vector against the enrolled set.
#[derive(Debug, Clone)]
pub struct MatchHit {
    pub student_id: String,
    pub name: String,
    /// Cosine similarity of the winning comparison [-1, 1].
    pub similarity: f32,
}

/// Strategy for scanning the enrolled set with a probe vector.
pub trait Matcher {
    fn find_match(
        &self,
        probe: &FeatureVector,
        enrolled: &[Enrollment],
        threshold: f32,
    ) -> Option<MatchHit>;
}

/// First-match scan in slice order.
///
/// Returns the lowest-index enrollment whose stored vector clears the
/// threshold. Callers get determinism by passing the enrolled set in a
/// fixed order (the store lists students name-ascending). Unenrolled
/// students (no vector) are skipped, not errors.
pub struct FirstMatchMatcher;

impl Matcher for FirstMatchMatcher {
    fn find_match(
        &self,
        probe: &FeatureVector,
        enrolled: &[Enrollment],
        threshold: f32,
    ) -> Option<MatchHit> {
        for entry in enrolled {
            let Some(stored) = &entry.features else {
                continue;
            };
            if probe.matches(stored, threshold) {
                return Some(MatchHit {
                    student_id: entry.student_id.clone(),
                    name: entry.name.clone(),
                    similarity: probe.similarity(stored),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_of(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    #[test]
    fn test_similarity_identical() {
        let a = vec_of(&[1.0, 2.0, 3.0]);
        let b = vec_of(&[1.0, 2.0, 3.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = vec_of(&[1.0, 0.0]);
        let b = vec_of(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = vec_of(&[0.0, 0.0]);
        let b = vec_of(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_matches_identical_below_one() {
        let a = vec_of(&[10.0, 20.0, 30.0]);
        assert!(a.matches(&a.clone(), 0.0));
        assert!(a.matches(&a.clone(), 0.8));
        assert!(a.matches(&a.clone(), 0.999));
    }

    #[test]
    fn test_matches_is_symmetric() {
        let cases = [
            (vec_of(&[1.0, 2.0, 3.0]), vec_of(&[3.0, 2.0, 1.0])),
            (vec_of(&[1.0, 0.0]), vec_of(&[0.0, 1.0])),
            (vec_of(&[255.0, 0.0, 128.0]), vec_of(&[250.0, 5.0, 120.0])),
            (vec_of(&[0.0, 0.0]), vec_of(&[1.0, 1.0])),
        ];
        for (a, b) in &cases {
            for t in [0.0, 0.5, 0.8, 0.99] {
                assert_eq!(a.matches(b, t), b.matches(a, t), "asymmetric at t={t}");
            }
        }
    }

    #[test]
    fn test_matches_length_mismatch() {
        let a = vec_of(&[1.0, 2.0, 3.0]);
        let b = vec_of(&[1.0, 2.0]);
        assert!(!a.matches(&b, 0.0));
        assert!(!b.matches(&a, 0.0));
    }

    #[test]
    fn test_matches_orthogonal_at_default_threshold() {
        let a = vec_of(&[1.0, 0.0]);
        let b = vec_of(&[0.0, 1.0]);
        assert!(!a.matches(&b, 0.8));
    }

    #[test]
    fn test_matches_zero_vector_never_matches() {
        let zero = vec_of(&[0.0, 0.0]);
        let other = vec_of(&[1.0, 1.0]);
        // Even a negative threshold must not turn undefined into a match.
        assert!(!zero.matches(&other, -1.0));
        assert!(!zero.matches(&zero.clone(), -1.0));
    }

    #[test]
    fn test_matches_threshold_is_strict() {
        let a = vec_of(&[1.0, 0.0]);
        let b = vec_of(&[1.0, 0.0]);
        // Similarity is exactly 1.0; a threshold of 1.0 must not match.
        assert!(!a.matches(&b, 1.0));
    }

    #[test]
    fn test_matches_empty_vectors() {
        let empty = FeatureVector::new(vec![]);
        assert!(!empty.matches(&empty.clone(), 0.0));
    }

    fn enrollment(id: &str, features: Option<FeatureVector>) -> Enrollment {
        Enrollment {
            student_id: id.into(),
            name: format!("student-{id}"),
            features,
        }
    }

    #[test]
    fn test_first_match_takes_lowest_index() {
        let probe = vec_of(&[1.0, 0.0, 0.0]);
        // Both index 1 and index 2 would clear the threshold.
        let enrolled = vec![
            enrollment("a", Some(vec_of(&[0.0, 1.0, 0.0]))),
            enrollment("b", Some(vec_of(&[1.0, 0.1, 0.0]))),
            enrollment("c", Some(vec_of(&[1.0, 0.0, 0.0]))),
        ];

        let hit = FirstMatchMatcher
            .find_match(&probe, &enrolled, 0.8)
            .expect("should match");
        assert_eq!(hit.student_id, "b");
        assert!(hit.similarity > 0.8);
    }

    #[test]
    fn test_first_match_skips_unenrolled() {
        let probe = vec_of(&[1.0, 0.0]);
        let enrolled = vec![
            enrollment("a", None),
            enrollment("b", Some(vec_of(&[1.0, 0.0]))),
        ];

        let hit = FirstMatchMatcher
            .find_match(&probe, &enrolled, 0.8)
            .expect("should match");
        assert_eq!(hit.student_id, "b");
    }

    #[test]
    fn test_first_match_none_when_no_match() {
        let probe = vec_of(&[1.0, 0.0]);
        let enrolled = vec![
            enrollment("a", Some(vec_of(&[0.0, 1.0]))),
            enrollment("b", None),
        ];
        assert!(FirstMatchMatcher.find_match(&probe, &enrolled, 0.8).is_none());
    }

    #[test]
    fn test_first_match_empty_gallery() {
        let probe = vec_of(&[1.0, 0.0]);
        assert!(FirstMatchMatcher.find_match(&probe, &[], 0.8).is_none());
    }

    #[test]
    fn test_feature_vector_serde_roundtrip() {
        let v = vec_of(&[0.0, 128.0, 255.0]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "[0.0,128.0,255.0]");
        let back: FeatureVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
