//! Nearest-identity matching with a fixed distance threshold.

use crate::registry::Registry;
use crate::types::{Classification, Descriptor, MatchResult};

/// Distance between two descriptors, supplied by the face encoder.
///
/// Values are treated as opaque: the matcher only orders and thresholds them.
pub trait DistanceMetric: Send + Sync {
    fn distance(&self, a: &Descriptor, b: &Descriptor) -> f32;
}

/// Euclidean threshold for the bundled ArcFace encoder.
///
/// Its descriptors are unit-length, so L2 distance relates to cosine
/// similarity as `d = sqrt(2 - 2 cos)`. 1.095 corresponds to cosine 0.40,
/// the usual ArcFace acceptance bound.
pub const ARCFACE_THRESHOLD: f32 = 1.095;

/// L2 distance that equals cosine similarity `similarity` on unit vectors.
pub fn euclidean_for_cosine(similarity: f32) -> f32 {
    (2.0 - 2.0 * similarity).max(0.0).sqrt()
}

/// Plain L2 distance.
///
/// Thresholds depend on the encoder: around 0.6 for 128-d dlib-style
/// descriptors, [`ARCFACE_THRESHOLD`] for L2-normalized ArcFace output.
#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl DistanceMetric for Euclidean {
    fn distance(&self, a: &Descriptor, b: &Descriptor) -> f32 {
        a.euclidean_distance(b)
    }
}

/// Classifies a query descriptor as one of the registry identities or unknown.
#[derive(Debug, Clone)]
pub struct Matcher<M = Euclidean> {
    metric: M,
    threshold: f32,
}

impl Matcher<Euclidean> {
    pub fn euclidean(threshold: f32) -> Self {
        Self::new(Euclidean, threshold)
    }
}

impl<M: DistanceMetric> Matcher<M> {
    pub fn new(metric: M, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Find the nearest identity to `query`.
    ///
    /// Ties keep the earliest registry entry. Distances strictly below the
    /// threshold are recognized. An empty registry short-circuits to unknown
    /// without evaluating the metric.
    pub fn identify<'r>(&self, query: &Descriptor, registry: &'r Registry) -> MatchResult<'r> {
        if registry.is_empty() {
            return MatchResult::unknown();
        }

        let mut best: Option<(usize, f32)> = None;
        for (idx, identity) in registry.identities().iter().enumerate() {
            let d = self.metric.distance(query, &identity.descriptor);
            // Strict comparison: an equal distance never displaces an earlier entry.
            if best.map_or(!d.is_nan(), |(_, b)| d < b) {
                best = Some((idx, d));
            }
        }

        let Some((idx, distance)) = best else {
            return MatchResult::unknown();
        };

        let classification = if distance < self.threshold {
            Classification::Recognized
        } else {
            Classification::Unknown
        };

        MatchResult {
            identity: Some(&registry.identities()[idx]),
            distance,
            classification,
        }
    }
}
