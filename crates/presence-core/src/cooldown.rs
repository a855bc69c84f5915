//! Global per-identity event deduplication.

use crate::types::IdentityId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tracks the last reported instant per identity, shared by every stream worker.
///
/// The check and the update happen under one lock, so when several workers
/// see the same person at the same moment exactly one of them wins.
#[derive(Debug)]
pub struct CooldownTracker {
    window: Duration,
    last_event: Mutex<HashMap<IdentityId, Instant>>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_event: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true, and records `now`, if `identity` has no event within the window.
    pub fn should_report(&self, identity: IdentityId, now: Instant) -> bool {
        // A poisoned map only means another worker panicked mid-insert; the
        // timestamps themselves are still valid.
        let mut map = self.last_event.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(&identity) {
            Some(&last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                map.insert(identity, now);
                true
            }
        }
    }

    /// Number of identities with a recorded event.
    pub fn tracked(&self) -> usize {
        self.last_event.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
