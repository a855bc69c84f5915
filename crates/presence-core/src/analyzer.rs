//! Face analysis capability: image in, regions plus descriptors out.

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceObservation;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Failed(String),
}

/// Detects faces and computes one descriptor per face.
///
/// Regions are reported in the coordinates of the image passed in.
/// Implementations are stateful (inference sessions), so each stream
/// worker owns its own instance and may move it onto its thread.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError>;
}

/// Creates per-worker analyzers.
pub trait AnalyzerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FaceAnalyzer>, AnalyzerError>;
}

/// SCRFD detection + landmark alignment + ArcFace descriptors.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, AnalyzerError> {
        Ok(Self {
            detector: FaceDetector::load(scrfd_path)?,
            recognizer: FaceRecognizer::load(arcface_path)?,
        })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
        let detections = self.detector.detect(image)?;
        let mut observations = Vec::with_capacity(detections.len());

        for det in detections {
            let Some(landmarks) = det.landmarks else {
                tracing::debug!(confidence = det.confidence, "face without landmarks skipped");
                continue;
            };
            let aligned = alignment::align_face(image, &landmarks);
            let descriptor = self.recognizer.extract(&aligned)?;
            observations.push(FaceObservation {
                region: det.region,
                descriptor,
            });
        }

        Ok(observations)
    }
}

/// Loads an [`OnnxAnalyzer`] from fixed model paths for every worker.
#[derive(Debug, Clone)]
pub struct OnnxAnalyzerFactory {
    pub scrfd_path: String,
    pub arcface_path: String,
}

impl AnalyzerFactory for OnnxAnalyzerFactory {
    fn create(&self) -> Result<Box<dyn FaceAnalyzer>, AnalyzerError> {
        Ok(Box::new(OnnxAnalyzer::load(&self.scrfd_path, &self.arcface_path)?))
    }
}
