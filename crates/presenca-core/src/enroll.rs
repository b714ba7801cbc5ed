//! Enrollment bookkeeping: sample accumulation, centroid commit, clearing.

use crate::types::{centroid, Embedding, FaceProfile, EMBEDDING_DIM};
use thiserror::Error;

/// Minimum samples required before a draft can be committed. Matches the
/// matcher's eligibility minimum, so a committed profile is always
/// match-eligible once its owner is active.
pub const MIN_ENROLL_SAMPLES: usize = crate::types::MIN_MATCH_SAMPLES;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnrollError {
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("insufficient samples: {got} collected, {required} required")]
    InsufficientSamples { got: usize, required: usize },
}

/// A biometric update to persist for one profile.
///
/// `Clear` removes samples *and* centroid — absence is distinguishable from
/// an empty sample set, which is what lets the matcher skip un-enrolled
/// profiles in O(1).
#[derive(Debug, Clone, PartialEq)]
pub enum BiometricUpdate {
    Set {
        samples: Vec<Embedding>,
        centroid: Embedding,
    },
    Clear,
}

/// In-progress enrollment for one profile.
///
/// Pure accumulation — nothing is persisted until the committed update is
/// applied through a [`ProfileStore`]. Committing replaces any previously
/// stored samples and centroid wholesale; stale samples are never mixed with
/// new ones.
#[derive(Debug, Clone)]
pub struct ProfileDraft {
    profile_id: String,
    samples: Vec<Embedding>,
}

impl ProfileDraft {
    pub fn new(profile_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            samples: Vec::new(),
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Append one sample embedding. Rejects anything that is not exactly
    /// [`EMBEDDING_DIM`] wide.
    pub fn add_sample(&mut self, embedding: Embedding) -> Result<(), EnrollError> {
        if embedding.dim() != EMBEDDING_DIM {
            return Err(EnrollError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                got: embedding.dim(),
            });
        }
        self.samples.push(embedding);
        Ok(())
    }

    /// Consume the draft into a persistable update with the centroid of
    /// exactly the collected samples.
    pub fn commit(self) -> Result<BiometricUpdate, EnrollError> {
        if self.samples.len() < MIN_ENROLL_SAMPLES {
            return Err(EnrollError::InsufficientSamples {
                got: self.samples.len(),
                required: MIN_ENROLL_SAMPLES,
            });
        }
        let Some(center) = centroid(&self.samples) else {
            return Err(EnrollError::InsufficientSamples {
                got: 0,
                required: MIN_ENROLL_SAMPLES,
            });
        };
        Ok(BiometricUpdate::Set {
            samples: self.samples,
            centroid: center,
        })
    }
}

/// Persistence seam for enrolled profiles.
///
/// Implementations must apply a [`BiometricUpdate`] atomically — a reader
/// never observes new samples alongside a stale centroid or vice versa.
#[allow(async_fn_in_trait)]
pub trait ProfileStore {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn load_profiles(&self) -> Result<Vec<FaceProfile>, Self::Error>;

    async fn apply_biometrics(
        &self,
        profile_id: &str,
        update: BiometricUpdate,
    ) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(fill: f32) -> Embedding {
        Embedding::new(vec![fill; EMBEDDING_DIM])
    }

    #[test]
    fn test_add_sample_rejects_wrong_dimension() {
        let mut draft = ProfileDraft::new("p1");
        let err = draft
            .add_sample(Embedding::new(vec![0.5; 64]))
            .unwrap_err();
        assert_eq!(
            err,
            EnrollError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                got: 64
            }
        );
        assert_eq!(draft.sample_count(), 0);
    }

    #[test]
    fn test_commit_with_two_samples_fails() {
        let mut draft = ProfileDraft::new("p1");
        draft.add_sample(sample(0.1)).unwrap();
        draft.add_sample(sample(0.2)).unwrap();
        let err = draft.commit().unwrap_err();
        assert_eq!(
            err,
            EnrollError::InsufficientSamples {
                got: 2,
                required: 3
            }
        );
    }

    #[test]
    fn test_commit_with_three_samples_yields_their_mean() {
        let mut draft = ProfileDraft::new("p1");
        draft.add_sample(sample(0.0)).unwrap();
        draft.add_sample(sample(0.3)).unwrap();
        draft.add_sample(sample(0.6)).unwrap();

        match draft.commit().unwrap() {
            BiometricUpdate::Set { samples, centroid } => {
                assert_eq!(samples.len(), 3);
                assert_eq!(centroid.dim(), EMBEDDING_DIM);
                for v in centroid.values {
                    assert!((v - 0.3).abs() < 1e-6);
                }
            }
            BiometricUpdate::Clear => panic!("commit must produce Set"),
        }
    }

    #[test]
    fn test_clear_is_not_an_empty_set() {
        assert_ne!(
            BiometricUpdate::Clear,
            BiometricUpdate::Set {
                samples: Vec::new(),
                centroid: Embedding::new(vec![0.0; EMBEDDING_DIM]),
            }
        );
    }
}
