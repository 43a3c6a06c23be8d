//! Nearest-neighbour matching of a probe descriptor against enrolled identities.

use thiserror::Error;

use crate::types::{Descriptor, Identity, MatchCandidate, MatchResult};

/// Default distance cutoff for the reference 128-d embedding model.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("descriptor dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("descriptor model version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
    #[error("invalid match threshold: {0}")]
    InvalidThreshold(f32),
    #[error("probe descriptor has non-finite value at index {index}")]
    NonFiniteProbe { index: usize },
}

/// Strategy for comparing a probe descriptor against a gallery of enrolled identities.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Descriptor,
        gallery: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Linear-scan Euclidean matcher.
///
/// The running best starts at `threshold`, so only candidates strictly closer
/// than the threshold can win. On equal distances the earlier gallery entry
/// wins; callers pass the gallery in store insertion order. Identities
/// without a descriptor are not candidates. A dimension or version mismatch
/// aborts the whole scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Descriptor,
        gallery: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(MatchError::InvalidThreshold(threshold));
        }

        let mut best_distance = threshold;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in gallery.iter().enumerate() {
            let Some(enrolled) = identity.descriptor.as_ref() else {
                continue;
            };
            let distance = probe.euclidean_distance(enrolled)?;
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        Ok(match best_idx {
            Some(idx) => MatchResult::Matched(MatchCandidate {
                handle: gallery[idx].handle.clone(),
                distance: best_distance,
            }),
            None => MatchResult::NoMatch,
        })
    }
}
