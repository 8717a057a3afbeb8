//! Nearest-neighbour identity matching.

use crate::types::{Embedding, Identity};
use thiserror::Error;

/// Tolerance when checking that a distance bound and a confidence bound agree.
const THRESHOLD_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
    #[error("max distance must be a finite, non-negative number (got {0})")]
    InvalidDistance(f64),
    #[error("min confidence must be a finite number <= 1.0 (got {0})")]
    InvalidConfidence(f64),
    #[error("max distance {max_distance} and min confidence {min_confidence} disagree (expected confidence {expected})")]
    Inconsistent {
        max_distance: f64,
        min_confidence: f64,
        expected: f64,
    },
}

/// Acceptance bound for a match.
///
/// Held as a maximum Euclidean distance; the equivalent minimum confidence is
/// always `1 - max_distance`, so the two expressions can never drift apart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThreshold {
    max_distance: f64,
}

impl MatchThreshold {
    pub fn from_max_distance(max_distance: f64) -> Result<Self, ThresholdError> {
        if !max_distance.is_finite() || max_distance < 0.0 {
            return Err(ThresholdError::InvalidDistance(max_distance));
        }
        Ok(Self { max_distance })
    }

    pub fn from_min_confidence(min_confidence: f64) -> Result<Self, ThresholdError> {
        if !min_confidence.is_finite() || min_confidence > 1.0 {
            return Err(ThresholdError::InvalidConfidence(min_confidence));
        }
        Self::from_max_distance(1.0 - min_confidence)
    }

    /// Build from whichever expressions are configured, falling back to
    /// `default_distance` when neither is. Both given must agree.
    pub fn resolve(
        max_distance: Option<f64>,
        min_confidence: Option<f64>,
        default_distance: f64,
    ) -> Result<Self, ThresholdError> {
        match (max_distance, min_confidence) {
            (Some(d), Some(c)) => {
                let threshold = Self::from_max_distance(d)?;
                let expected = threshold.min_confidence();
                if (expected - c).abs() > THRESHOLD_EPSILON {
                    return Err(ThresholdError::Inconsistent {
                        max_distance: d,
                        min_confidence: c,
                        expected,
                    });
                }
                Ok(threshold)
            }
            (Some(d), None) => Self::from_max_distance(d),
            (None, Some(c)) => Self::from_min_confidence(c),
            (None, None) => Self::from_max_distance(default_distance),
        }
    }

    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    pub fn min_confidence(&self) -> f64 {
        1.0 - self.max_distance
    }

    /// Inclusive: a distance equal to the bound is accepted.
    pub fn accepts(&self, distance: f64) -> bool {
        distance <= self.max_distance
    }
}

/// Outcome of matching one probe against the roster.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        identity_id: String,
        display_name: String,
        distance: f64,
        /// `1 - distance`; reported for observability, not used to decide.
        confidence: f64,
    },
    NoMatch,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    pub fn identity_id(&self) -> Option<&str> {
        match self {
            MatchResult::Matched { identity_id, .. } => Some(identity_id),
            MatchResult::NoMatch => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            MatchResult::Matched { confidence, .. } => Some(*confidence),
            MatchResult::NoMatch => None,
        }
    }
}

/// Strategy for comparing a probe embedding against the roster.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, roster: &[Identity]) -> MatchResult;
}

/// Selects the minimum-distance identity among all within the threshold.
///
/// Every roster entry is visited; the winner does not depend on roster order
/// except for exact distance ties, which are left unspecified.
pub struct NearestMatcher {
    threshold: MatchThreshold,
}

impl NearestMatcher {
    pub fn new(threshold: MatchThreshold) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> MatchThreshold {
        self.threshold
    }
}

impl Matcher for NearestMatcher {
    fn compare(&self, probe: &Embedding, roster: &[Identity]) -> MatchResult {
        let mut best: Option<(usize, f64)> = None;

        for (i, identity) in roster.iter().enumerate() {
            let Some(distance) = probe.euclidean_distance(&identity.embedding) else {
                tracing::warn!(
                    identity = %identity.id,
                    probe_dim = probe.len(),
                    roster_dim = identity.embedding.len(),
                    "embedding length mismatch; skipping roster entry"
                );
                continue;
            };
            if !self.threshold.accepts(distance) {
                continue;
            }
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) => MatchResult::Matched {
                identity_id: roster[idx].id.clone(),
                display_name: roster[idx].display_name.clone(),
                distance,
                confidence: 1.0 - distance,
            },
            None => MatchResult::NoMatch,
        }
    }
}
