use presence_core::IdentityId;
use thiserror::Error;

/// Failures a stream worker handles without stopping the process.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Opening the source failed; retried after backoff.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// One read failed; counted against the read-failure tolerance.
    #[error("frame read failed: {0}")]
    FrameReadFailure(String),
    /// Analysis of a frame failed or panicked; the worker reconnects.
    #[error("detection failed: {0}")]
    DetectionFailure(String),
    /// Every delivery attempt failed; the event is lost.
    #[error("event for identity {identity_id} lost after {attempts} attempts")]
    DeliveryFailure { identity_id: IdentityId, attempts: u32 },
}

impl WorkerError {
    /// Stable value of the `kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::SourceUnavailable(_) => "source_unavailable",
            WorkerError::FrameReadFailure(_) => "frame_read_failure",
            WorkerError::DetectionFailure(_) => "detection_failure",
            WorkerError::DeliveryFailure { .. } => "delivery_failure",
        }
    }
}
