//! Nearest-template matching of a single probe.

use crate::types::{Descriptor, IdentityId, Template};

/// Distance threshold used when none is configured (128-d embeddings).
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Descriptor length produced by the default extractor.
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

/// Result of matching a probe against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, set only when `distance` is strictly below the threshold.
    pub identity: Option<IdentityId>,
    /// Smallest distance seen over all comparable templates, if any.
    pub distance: Option<f32>,
    /// Another identity reached exactly the same minimum distance.
    pub ambiguous: bool,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Strategy for comparing a probe against a gallery of enrolled templates.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Descriptor, gallery: &[Template], threshold: f32) -> MatchResult;
}

/// Euclidean nearest-template matcher.
///
/// Templates whose length differs from the probe are skipped, as are
/// non-finite distances. On an exact tie between two identities the one seen
/// first in gallery order is kept and the result is flagged ambiguous.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, gallery: &[Template], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;
        let mut ambiguous = false;

        for (i, template) in gallery.iter().enumerate() {
            if template.descriptor.len() != probe.len() {
                continue;
            }
            let dist = probe.euclidean_distance(&template.descriptor);
            if !dist.is_finite() {
                continue;
            }
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
                ambiguous = false;
            } else if dist == best_dist {
                if let Some(idx) = best_idx {
                    if gallery[idx].identity != template.identity {
                        ambiguous = true;
                    }
                }
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                identity: Some(gallery[idx].identity.clone()),
                distance: Some(best_dist),
                ambiguous,
            },
            Some(_) => MatchResult {
                identity: None,
                distance: Some(best_dist),
                ambiguous,
            },
            None => MatchResult {
                identity: None,
                distance: None,
                ambiguous: false,
            },
        }
    }
}

/// Best identity for `probe` among `candidates`, or `None` if nothing is
/// strictly closer than `threshold`.
pub fn best_match(
    probe: &Descriptor,
    candidates: &[Template],
    threshold: f32,
) -> Option<IdentityId> {
    EuclideanMatcher.compare(probe, candidates, threshold).identity
}
