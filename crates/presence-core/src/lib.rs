//! presence-core: identity registry, matching, and event deduplication.
//!
//! Also hosts the face analysis capability: SCRFD detection and ArcFace
//! descriptors via ONNX Runtime, behind the [`FaceAnalyzer`] trait.

pub mod alignment;
pub mod analyzer;
pub mod cooldown;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod registry;
pub mod types;

pub use analyzer::{AnalyzerError, AnalyzerFactory, FaceAnalyzer, OnnxAnalyzer, OnnxAnalyzerFactory};
pub use cooldown::CooldownTracker;
pub use matcher::{euclidean_for_cosine, DistanceMetric, Euclidean, Matcher, ARCFACE_THRESHOLD};
pub use registry::{FetchedRow, IdentityRow, IdentityStore, LoadReport, Registry, RegistryError};
pub use types::{
    Classification, Descriptor, DescriptorError, FaceObservation, FaceRegion, Identity, IdentityId,
    MatchResult, PresenceEvent,
};

/// Install location of the ONNX models when `PRESENCE_MODEL_DIR` is unset.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/presence/models")
}
