//! presenced: multi-stream presence daemon.
//!
//! One worker thread per configured video stream detects and identifies
//! faces; recognized people are reported to the attendance endpoint at
//! most once per cooldown window. A supervisor thread restarts any worker
//! that exits.

pub mod config;
pub mod error;
pub mod feedback;
pub mod pipeline;
pub mod reporter;
pub mod stop;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use config::{Config, ConfigError, StreamConfig};
pub use error::WorkerError;
pub use pipeline::{Outcome, Recognition};
pub use reporter::{DeliveryError, EventReporter, EventSink, HttpTransport};
pub use stop::StopSignal;
pub use store::SqliteIdentityStore;
pub use supervisor::{Supervisor, WorkerHandle, WorkerLauncher};
pub use worker::{StreamLauncher, StreamWorker, WorkerSettings};
