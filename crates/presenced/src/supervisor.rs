//! Keeps one live worker per configured stream.

use presence_hw::redact_uri;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::stop::StopSignal;

/// A running (or exited) worker thread.
pub struct WorkerHandle {
    stream: StreamConfig,
    generation: u64,
    alive: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// Clears the liveness flag when the worker body returns or unwinds.
struct LivenessGuard(Arc<AtomicBool>);

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl WorkerHandle {
    /// Run `body` on a thread named `stream-<label>`.
    pub fn spawn<F>(stream: StreamConfig, generation: u64, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let guard = LivenessGuard(Arc::clone(&alive));
        let join = std::thread::Builder::new()
            .name(format!("stream-{}", stream.label))
            .spawn(move || {
                let _guard = guard;
                body();
            })?;
        Ok(Self {
            stream,
            generation,
            alive,
            join: Some(join),
        })
    }

    pub fn stream_label(&self) -> &str {
        &self.stream.label
    }

    pub fn source_uri(&self) -> &str {
        &self.stream.uri
    }

    /// How many times this stream's worker has been started before this one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Wait for the thread to finish. Returns false if it panicked.
    fn join(&mut self) -> bool {
        match self.join.take() {
            Some(join) => join.join().is_ok(),
            None => true,
        }
    }
}

/// Starts a worker thread for a stream.
pub trait WorkerLauncher: Send {
    fn launch(&self, stream: &StreamConfig, generation: u64) -> std::io::Result<WorkerHandle>;
}

/// One configured stream and its current worker, if one could be started.
struct Slot {
    stream: StreamConfig,
    handle: Option<WorkerHandle>,
    next_generation: u64,
}

/// Restarts any worker whose loop has exited, every poll interval, without limit.
pub struct Supervisor<L> {
    launcher: L,
    slots: Vec<Slot>,
    poll_interval: Duration,
    stop: StopSignal,
}

impl<L: WorkerLauncher> Supervisor<L> {
    /// Launch one worker per stream.
    pub fn start(
        launcher: L,
        streams: &[StreamConfig],
        poll_interval: Duration,
        stop: StopSignal,
    ) -> Self {
        let mut supervisor = Self {
            launcher,
            slots: streams
                .iter()
                .map(|stream| Slot {
                    stream: stream.clone(),
                    handle: None,
                    next_generation: 0,
                })
                .collect(),
            poll_interval,
            stop,
        };
        for index in 0..supervisor.slots.len() {
            supervisor.launch(index);
        }
        supervisor
    }

    fn launch(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let generation = slot.next_generation;
        slot.next_generation += 1;
        match self.launcher.launch(&slot.stream, generation) {
            Ok(handle) => {
                tracing::debug!(stream = %slot.stream.label, generation, "worker launched");
                slot.handle = Some(handle);
            }
            Err(e) => {
                tracing::error!(
                    stream = %slot.stream.label,
                    error = %e,
                    "cannot spawn worker thread, retrying next poll"
                );
                slot.handle = None;
            }
        }
    }

    /// Replace every exited worker. Returns how many were restarted.
    pub fn poll_once(&mut self) -> usize {
        if self.stop.is_stopped() {
            return 0;
        }
        let mut restarted = 0;
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.handle.as_ref().is_some_and(WorkerHandle::is_alive) {
                continue;
            }
            if let Some(mut dead) = slot.handle.take() {
                let clean = dead.join();
                tracing::warn!(
                    stream = %dead.stream_label(),
                    uri = %redact_uri(dead.source_uri()),
                    generation = dead.generation(),
                    panicked = !clean,
                    "worker exited, restarting"
                );
            }
            self.launch(index);
            restarted += 1;
        }
        restarted
    }

    pub fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.slots.iter().filter_map(|slot| slot.handle.as_ref())
    }

    /// Poll until a stop is requested, then wait for every worker to exit.
    pub fn run(mut self) {
        tracing::info!(
            workers = self.slots.len(),
            poll_secs = self.poll_interval.as_secs_f32(),
            "supervisor started"
        );
        while !self.stop.wait(self.poll_interval) {
            self.poll_once();
        }
        tracing::info!("stop requested, waiting for workers");
        for slot in &mut self.slots {
            if let Some(mut handle) = slot.handle.take() {
                handle.join();
            }
        }
        tracing::info!("supervisor stopped");
    }
}
