use serde::{Deserialize, Serialize};

/// Dimension of the embedding vectors produced by the extractor.
pub const EMBEDDING_DIM: usize = 128;

/// Minimum number of enrolled samples for a profile to participate in matching.
pub const MIN_MATCH_SAMPLES: usize = 3;

/// Face embedding vector (128-dimensional, raw extractor output).
///
/// Values are kept exactly as produced — no normalization. Every distance
/// threshold in this crate is calibrated against raw Euclidean distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Elementwise arithmetic mean of a set of sample embeddings.
///
/// Returns `None` for an empty slice — a profile without samples has no
/// centroid at all, as opposed to a zero centroid.
pub fn centroid(samples: &[Embedding]) -> Option<Embedding> {
    let first = samples.first()?;
    let mut sum = vec![0.0f64; first.dim()];
    for sample in samples {
        for (acc, v) in sum.iter_mut().zip(sample.values.iter()) {
            *acc += f64::from(*v);
        }
    }
    let n = samples.len() as f64;
    Some(Embedding::new(
        sum.into_iter().map(|v| (v / n) as f32).collect(),
    ))
}

/// Explicit tagged result for every boundary that may see no face in frame.
///
/// `NotDetected` is a normal outcome, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection<T> {
    Detected(T),
    NotDetected,
}

impl<T> Detection<T> {
    pub fn is_detected(&self) -> bool {
        matches!(self, Detection::Detected(_))
    }

    pub fn detected(self) -> Option<T> {
        match self {
            Detection::Detected(value) => Some(value),
            Detection::NotDetected => None,
        }
    }

    pub fn as_ref(&self) -> Detection<&T> {
        match self {
            Detection::Detected(value) => Detection::Detected(value),
            Detection::NotDetected => Detection::NotDetected,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Detection<U> {
        match self {
            Detection::Detected(value) => Detection::Detected(f(value)),
            Detection::NotDetected => Detection::NotDetected,
        }
    }
}

/// An enrolled identity with its biometric samples.
///
/// Invariant: `centroid` is `Some` iff `samples` is non-empty, and equals the
/// elementwise mean of `samples`. A profile whose biometrics were cleared has
/// both fields absent, so the matcher skips it in O(1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceProfile {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub samples: Vec<Embedding>,
    pub centroid: Option<Embedding>,
}

impl FaceProfile {
    /// Whether this profile participates in 1:N identification.
    pub fn match_eligible(&self) -> bool {
        self.active && self.centroid.is_some() && self.samples.len() >= MIN_MATCH_SAMPLES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centroid_single_sample_is_identity() {
        let v = Embedding::new(vec![0.25, -1.5, 3.0]);
        let c = centroid(std::slice::from_ref(&v)).unwrap();
        assert_eq!(c, v);
    }

    #[test]
    fn test_centroid_is_elementwise_mean() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        let b = Embedding::new(vec![3.0, 6.0, -3.0]);
        let c = centroid(&[a, b]).unwrap();
        assert_eq!(c.values, vec![2.0, 4.0, 0.0]);
    }

    #[test]
    fn test_centroid_empty_is_none() {
        assert!(centroid(&[]).is_none());
    }

    #[test]
    fn test_euclidean_distance_known_geometry() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_match_eligibility_requires_three_samples() {
        let sample = Embedding::new(vec![1.0]);
        let mut profile = FaceProfile {
            id: "p1".into(),
            name: "Ana".into(),
            active: true,
            samples: vec![sample.clone(), sample.clone()],
            centroid: Some(sample.clone()),
        };
        assert!(!profile.match_eligible());

        profile.samples.push(sample);
        assert!(profile.match_eligible());

        profile.active = false;
        assert!(!profile.match_eligible());
    }

    #[test]
    fn test_cleared_profile_not_eligible() {
        let profile = FaceProfile {
            id: "p1".into(),
            name: "Ana".into(),
            active: true,
            samples: Vec::new(),
            centroid: None,
        };
        assert!(!profile.match_eligible());
    }

    #[test]
    fn test_detection_map_preserves_tag() {
        let d = Detection::Detected(2).map(|v| v * 3);
        assert_eq!(d, Detection::Detected(6));
        let n: Detection<i32> = Detection::NotDetected;
        assert_eq!(n.map(|v| v * 3), Detection::NotDetected);
    }
}
