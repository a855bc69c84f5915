//! Presence event delivery over HTTP with bounded, fixed-delay retries.

use presence_core::{IdentityId, PresenceEvent};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("http client: {0}")]
    Client(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Sends one JSON body and returns the HTTP status code.
pub trait Transport: Send + Sync {
    fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<u16, DeliveryError>;
}

/// Blocking `reqwest` client. Its connection pool is shared by every worker.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build a client whose requests give up after `timeout`.
    ///
    /// Must be called outside any async runtime.
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<u16, DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .map_err(|e| DeliveryError::Request(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Anything that can deliver a presence event. Returns true on confirmed delivery.
pub trait EventSink: Send + Sync {
    fn report(&self, event: &PresenceEvent) -> bool;
}

#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub url: String,
    /// Total attempts per event, including the first.
    pub attempts: u32,
    /// Pause between attempts. Constant, not grown.
    pub retry_delay: Duration,
}

#[derive(Serialize)]
struct AttendanceRecord {
    id_utilisateur: IdentityId,
}

pub struct EventReporter<T = HttpTransport> {
    transport: T,
    settings: ReporterSettings,
}

impl<T: Transport> EventReporter<T> {
    pub fn new(transport: T, settings: ReporterSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &ReporterSettings {
        &self.settings
    }
}

impl<T: Transport> EventSink for EventReporter<T> {
    fn report(&self, event: &PresenceEvent) -> bool {
        let body = match serde_json::to_value(AttendanceRecord {
            id_utilisateur: event.identity_id,
        }) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(kind = "delivery_failure", error = %e, "cannot encode event");
                return false;
            }
        };

        let attempts = self.settings.attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.post_json(&self.settings.url, &body) {
                Ok(200) => {
                    tracing::info!(
                        identity = event.identity_id,
                        stream = %event.stream_label,
                        attempt,
                        "presence event delivered"
                    );
                    return true;
                }
                Ok(status) => tracing::warn!(
                    identity = event.identity_id,
                    attempt,
                    status,
                    "delivery rejected"
                ),
                Err(e) => tracing::warn!(
                    identity = event.identity_id,
                    attempt,
                    error = %e,
                    "delivery attempt failed"
                ),
            }
            if attempt < attempts {
                std::thread::sleep(self.settings.retry_delay);
            }
        }
        false
    }
}
