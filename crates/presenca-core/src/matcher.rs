//! Two-stage 1:N face identification.
//!
//! Coarse stage: Euclidean distance from the probe to every eligible
//! profile's centroid. Fine stage: distance to each enrolled sample of the
//! single coarse-best profile. The fine stage never touches any other
//! profile, so the scan is O(N) centroids + O(M) samples, never O(N·M) —
//! acceptable for the small rosters (tens to low hundreds) this system
//! targets.

use crate::types::{Embedding, FaceProfile};

/// Default Euclidean distance threshold for a positive match, on raw
/// un-normalized 128-d embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of identifying a probe against the roster.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched {
        profile_id: String,
        name: String,
        /// Minimum fine-stage distance.
        distance: f32,
    },
    NoMatch,
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }
}

/// Strategy for identifying a probe embedding against an enrolled roster.
pub trait Matcher {
    fn identify(&self, probe: &Embedding, roster: &[FaceProfile]) -> MatchOutcome;
}

/// Centroid-coarse, per-sample-fine nearest-neighbor matcher.
pub struct TwoStageMatcher {
    pub threshold: f32,
}

impl TwoStageMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for TwoStageMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl Matcher for TwoStageMatcher {
    fn identify(&self, probe: &Embedding, roster: &[FaceProfile]) -> MatchOutcome {
        // Coarse: nearest centroid across eligible profiles. Strict `<` when
        // replacing the running best means equidistant centroids resolve to
        // the first profile in roster order.
        let mut best: Option<(&FaceProfile, f32)> = None;
        for profile in roster.iter().filter(|p| p.match_eligible()) {
            let Some(center) = profile.centroid.as_ref() else {
                continue;
            };
            let dist = probe.euclidean_distance(center);
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((profile, dist)),
            }
        }
        let Some((candidate, coarse_dist)) = best else {
            return MatchOutcome::NoMatch;
        };

        // Fine: per-sample distance within the coarse winner only.
        let min_dist = candidate
            .samples
            .iter()
            .map(|s| probe.euclidean_distance(s))
            .fold(f32::INFINITY, f32::min);
        let min_dist = if min_dist.is_finite() {
            min_dist
        } else {
            coarse_dist
        };

        // Strict inequality: a distance exactly at the threshold is a miss.
        if min_dist < self.threshold {
            MatchOutcome::Matched {
                profile_id: candidate.id.clone(),
                name: candidate.name.clone(),
                distance: min_dist,
            }
        } else {
            MatchOutcome::NoMatch
        }
    }
}
