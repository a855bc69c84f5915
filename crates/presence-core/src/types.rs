use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Primary key of an enrolled person in the identity store.
pub type IdentityId = i64;

#[derive(Error, Debug, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor blob is empty")]
    Empty,
    #[error("descriptor blob length {0} is not a multiple of 4 bytes")]
    TruncatedBlob(usize),
    #[error("descriptor JSON is not a numeric array: {0}")]
    Json(String),
    #[error("descriptor value at index {0} is not finite")]
    NonFinite(usize),
}

/// Fixed-length face descriptor (128-d for dlib-style encoders, 512-d for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two descriptors.
    ///
    /// Descriptors of different dimension are never comparable and report
    /// an infinite distance, so they can never clear a threshold.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Decode a stored descriptor blob.
    ///
    /// Two encodings are accepted: a JSON numeric array (`[0.1, -0.2, ...]`),
    /// or packed little-endian `f32` values.
    pub fn decode(blob: &[u8]) -> Result<Self, DescriptorError> {
        if blob.is_empty() {
            return Err(DescriptorError::Empty);
        }

        let values: Vec<f32> = if blob.first() == Some(&b'[') {
            serde_json::from_slice(blob).map_err(|e| DescriptorError::Json(e.to_string()))?
        } else {
            if blob.len() % 4 != 0 {
                return Err(DescriptorError::TruncatedBlob(blob.len()));
            }
            blob.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        };

        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite(idx));
        }

        Ok(Self { values })
    }

    /// Encode as packed little-endian `f32`, the inverse of [`decode`](Self::decode).
    pub fn encode(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// A known person, loaded once from the identity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    /// Department or team the person belongs to.
    pub group_label: String,
    pub descriptor: Descriptor,
}

impl Identity {
    /// Human-readable label: "Name - Group", or just the name when no group is set.
    pub fn caption(&self) -> String {
        if self.group_label.is_empty() {
            self.display_name.clone()
        } else {
            format!("{} - {}", self.display_name, self.group_label)
        }
    }
}

/// Face bounding box as (top, right, bottom, left) pixel edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl FaceRegion {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Multiply every edge by `factor` (e.g. map detection space back to source space).
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            top: self.top * factor,
            right: self.right * factor,
            bottom: self.bottom * factor,
            left: self.left * factor,
        }
    }
}

/// One detected face in one frame. Never persisted.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub region: FaceRegion,
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Recognized,
    Unknown,
}

/// Outcome of matching one descriptor against the registry.
#[derive(Debug, Clone)]
pub struct MatchResult<'r> {
    /// Nearest registry identity, if the registry was non-empty.
    pub identity: Option<&'r Identity>,
    /// Distance to `identity`; infinite when there was nothing to compare.
    pub distance: f32,
    pub classification: Classification,
}

impl MatchResult<'_> {
    pub fn unknown() -> Self {
        MatchResult {
            identity: None,
            distance: f32::INFINITY,
            classification: Classification::Unknown,
        }
    }

    pub fn is_recognized(&self) -> bool {
        self.classification == Classification::Recognized
    }
}

/// A deduplicated sighting handed to the event reporter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEvent {
    pub identity_id: IdentityId,
    pub observed_at: DateTime<Utc>,
    pub stream_label: String,
}
