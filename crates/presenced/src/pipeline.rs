//! Per-face decision: match, deduplicate, report, and give feedback.

use chrono::Utc;
use presence_core::{CooldownTracker, FaceObservation, IdentityId, Matcher, PresenceEvent, Registry};
use std::sync::Arc;
use std::time::Instant;

use crate::error::WorkerError;
use crate::feedback::Feedback;
use crate::reporter::EventSink;

/// What happened to one observed face.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Recognized and outside the cooldown window; an event was sent.
    Reported { identity_id: IdentityId, delivered: bool },
    /// Recognized but inside the cooldown window.
    Suppressed { identity_id: IdentityId },
    Unknown,
}

impl Outcome {
    pub fn identity_id(&self) -> Option<IdentityId> {
        match self {
            Outcome::Reported { identity_id, .. } | Outcome::Suppressed { identity_id } => {
                Some(*identity_id)
            }
            Outcome::Unknown => None,
        }
    }
}

/// State shared by every stream worker.
pub struct Recognition {
    registry: Arc<Registry>,
    matcher: Matcher,
    cooldown: CooldownTracker,
    events: Arc<dyn EventSink>,
    feedback: Arc<dyn Feedback>,
    delivery_attempts: u32,
}

impl Recognition {
    pub fn new(
        registry: Arc<Registry>,
        matcher: Matcher,
        cooldown: CooldownTracker,
        events: Arc<dyn EventSink>,
        feedback: Arc<dyn Feedback>,
    ) -> Self {
        Self {
            registry,
            matcher,
            cooldown,
            events,
            feedback,
            delivery_attempts: 1,
        }
    }

    /// Attempt count reported in "event lost" log lines.
    pub fn with_delivery_attempts(mut self, attempts: u32) -> Self {
        self.delivery_attempts = attempts;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn feedback(&self) -> &dyn Feedback {
        self.feedback.as_ref()
    }

    /// Decide what to do with one face seen on `stream_label` at `now`.
    ///
    /// Blocks for the duration of event delivery when an event is sent.
    pub fn observe(&self, stream_label: &str, observation: &FaceObservation, now: Instant) -> Outcome {
        let result = self.matcher.identify(&observation.descriptor, &self.registry);
        let identity = match result.identity {
            Some(identity) if result.is_recognized() => identity,
            _ => {
                tracing::debug!(stream = stream_label, distance = result.distance, "unknown face");
                self.feedback.unknown(stream_label);
                return Outcome::Unknown;
            }
        };

        if !self.cooldown.should_report(identity.id, now) {
            tracing::trace!(stream = stream_label, identity = identity.id, "within cooldown");
            return Outcome::Suppressed {
                identity_id: identity.id,
            };
        }

        tracing::info!(
            stream = stream_label,
            identity = identity.id,
            name = %identity.caption(),
            distance = result.distance,
            "presence detected"
        );

        let event = PresenceEvent {
            identity_id: identity.id,
            observed_at: Utc::now(),
            stream_label: stream_label.to_string(),
        };
        let delivered = self.events.report(&event);
        if !delivered {
            let err = WorkerError::DeliveryFailure {
                identity_id: identity.id,
                attempts: self.delivery_attempts,
            };
            tracing::error!(stream = stream_label, kind = err.kind(), error = %err, "event lost");
        }
        self.feedback.recognized(identity, stream_label);

        Outcome::Reported {
            identity_id: identity.id,
            delivered,
        }
    }
}
