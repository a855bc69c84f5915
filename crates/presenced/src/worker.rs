//! Per-stream worker: connect, stream, recover, and stop on request.
//!
//! The worker is an explicit state machine driven by [`StreamWorker::step`].
//! The open source is owned by the `Streaming` state, so leaving that state
//! by any path drops and releases it.

use presence_core::{
    AnalyzerFactory, Classification, FaceAnalyzer, FaceObservation, Identity,
};
use presence_hw::{redact_uri, Frame, SourceOpener, VideoSource};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::StreamConfig;
use crate::error::WorkerError;
use crate::feedback::Annotation;
use crate::pipeline::{Outcome, Recognition};
use crate::stop::StopSignal;
use crate::supervisor::{WorkerHandle, WorkerLauncher};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed reads tolerated; one more sends the worker to recovery.
    pub read_failure_tolerance: u32,
    pub read_retry_delay: Duration,
    pub detection_scale: f32,
    pub display_scale: f32,
}

/// Reconnect delay: starts at `initial`, doubles per use, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to sleep now. Doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .map_or(self.max, |d| d.min(self.max));
        delay
    }

    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub enum WorkerState {
    Connecting,
    Streaming(Box<dyn VideoSource>),
    Recovering,
    Stopped,
}

impl WorkerState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerState::Connecting => "connecting",
            WorkerState::Streaming(_) => "streaming",
            WorkerState::Recovering => "recovering",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Debug for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct StreamWorker {
    stream: StreamConfig,
    opener: Arc<dyn SourceOpener>,
    analyzer: Box<dyn FaceAnalyzer>,
    recognition: Arc<Recognition>,
    settings: WorkerSettings,
    stop: StopSignal,
    backoff: Backoff,
    read_failures: u32,
}

impl StreamWorker {
    pub fn new(
        stream: StreamConfig,
        opener: Arc<dyn SourceOpener>,
        analyzer: Box<dyn FaceAnalyzer>,
        recognition: Arc<Recognition>,
        settings: WorkerSettings,
        stop: StopSignal,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
        Self {
            stream,
            opener,
            analyzer,
            recognition,
            settings,
            stop,
            backoff,
            read_failures: 0,
        }
    }

    /// Drive the state machine until a stop is requested.
    pub fn run(mut self) {
        tracing::info!(
            stream = %self.stream.label,
            uri = %redact_uri(&self.stream.uri),
            "worker started"
        );
        let mut state = WorkerState::Connecting;
        while !matches!(state, WorkerState::Stopped) {
            state = self.step(state);
        }
        tracing::info!(stream = %self.stream.label, "worker stopped");
    }

    /// Perform one transition.
    pub fn step(&mut self, state: WorkerState) -> WorkerState {
        if self.stop.is_stopped() {
            return WorkerState::Stopped;
        }
        match state {
            WorkerState::Connecting => self.connect(),
            WorkerState::Streaming(source) => self.stream(source),
            WorkerState::Recovering => self.recover(),
            WorkerState::Stopped => WorkerState::Stopped,
        }
    }

    fn connect(&mut self) -> WorkerState {
        match self.opener.open(&self.stream.uri) {
            Ok(source) => {
                tracing::info!(stream = %self.stream.label, "stream connected");
                self.backoff.reset();
                self.read_failures = 0;
                WorkerState::Streaming(source)
            }
            Err(e) => {
                let err = WorkerError::SourceUnavailable(e.to_string());
                let delay = self.backoff.next_delay();
                tracing::warn!(
                    stream = %self.stream.label,
                    kind = err.kind(),
                    error = %err,
                    retry_in_secs = delay.as_secs_f32(),
                    "cannot open stream"
                );
                self.sleep_or_stop(delay, WorkerState::Connecting)
            }
        }
    }

    fn stream(&mut self, mut source: Box<dyn VideoSource>) -> WorkerState {
        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                self.read_failures += 1;
                let err = WorkerError::FrameReadFailure(e.to_string());
                if self.read_failures > self.settings.read_failure_tolerance {
                    tracing::warn!(
                        stream = %self.stream.label,
                        kind = err.kind(),
                        error = %err,
                        consecutive = self.read_failures,
                        "too many read failures, reconnecting"
                    );
                    return WorkerState::Recovering;
                }
                tracing::debug!(
                    stream = %self.stream.label,
                    kind = err.kind(),
                    error = %err,
                    consecutive = self.read_failures,
                    "frame read failed"
                );
                return self.sleep_or_stop(
                    self.settings.read_retry_delay,
                    WorkerState::Streaming(source),
                );
            }
        };
        self.read_failures = 0;

        match self.process_guarded(&frame) {
            Ok(_) => WorkerState::Streaming(source),
            Err(err) => {
                tracing::error!(
                    stream = %self.stream.label,
                    kind = err.kind(),
                    error = %err,
                    frame = frame.sequence,
                    "frame processing failed, reconnecting"
                );
                WorkerState::Recovering
            }
        }
    }

    fn recover(&mut self) -> WorkerState {
        let delay = self.backoff.next_delay();
        tracing::info!(
            stream = %self.stream.label,
            retry_in_secs = delay.as_secs_f32(),
            "stream released, reconnecting after backoff"
        );
        self.sleep_or_stop(delay, WorkerState::Connecting)
    }

    fn sleep_or_stop(&self, delay: Duration, next: WorkerState) -> WorkerState {
        if self.stop.wait(delay) {
            WorkerState::Stopped
        } else {
            next
        }
    }

    fn process_guarded(&mut self, frame: &Frame) -> Result<usize, WorkerError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.process(frame))).unwrap_or_else(|payload| {
            Err(WorkerError::DetectionFailure(format!(
                "panic: {}",
                panic_message(payload.as_ref())
            )))
        })
    }

    /// Analyze one frame and act on every face in it. Returns the face count.
    fn process(&mut self, frame: &Frame) -> Result<usize, WorkerError> {
        let scale = self.settings.detection_scale;
        let small = frame
            .downscaled(scale)
            .map_err(|e| WorkerError::DetectionFailure(e.to_string()))?;
        let observations = self
            .analyzer
            .analyze(&small)
            .map_err(|e| WorkerError::DetectionFailure(e.to_string()))?;

        let now = Instant::now();
        let mut annotations = Vec::with_capacity(observations.len());
        for mut observation in observations {
            observation.region = observation.region.scaled(1.0 / scale);
            let outcome = self
                .recognition
                .observe(&self.stream.label, &observation, now);
            annotations.push(self.annotation(&observation, &outcome));
        }

        self.recognition
            .feedback()
            .annotate(&self.stream.label, frame, &annotations);
        Ok(annotations.len())
    }

    fn annotation(&self, observation: &FaceObservation, outcome: &Outcome) -> Annotation {
        let identity = outcome
            .identity_id()
            .and_then(|id| self.recognition.registry().get(id));
        Annotation {
            region: observation.region.scaled(self.settings.display_scale),
            label: identity
                .map(Identity::caption)
                .unwrap_or_else(|| "Unknown".to_string()),
            classification: if identity.is_some() {
                Classification::Recognized
            } else {
                Classification::Unknown
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Launches real stream workers on named threads.
pub struct StreamLauncher {
    pub opener: Arc<dyn SourceOpener>,
    pub analyzers: Arc<dyn AnalyzerFactory>,
    pub recognition: Arc<Recognition>,
    pub settings: WorkerSettings,
    pub stop: StopSignal,
}

impl WorkerLauncher for StreamLauncher {
    fn launch(&self, stream: &StreamConfig, generation: u64) -> std::io::Result<WorkerHandle> {
        let opener = Arc::clone(&self.opener);
        let analyzers = Arc::clone(&self.analyzers);
        let recognition = Arc::clone(&self.recognition);
        let settings = self.settings.clone();
        let stop = self.stop.clone();
        let config = stream.clone();

        WorkerHandle::spawn(stream.clone(), generation, move || {
            let analyzer = match analyzers.create() {
                Ok(analyzer) => analyzer,
                Err(e) => {
                    let err = WorkerError::DetectionFailure(e.to_string());
                    tracing::error!(
                        stream = %config.label,
                        kind = err.kind(),
                        error = %err,
                        "face analyzer unavailable, worker exiting"
                    );
                    return;
                }
            };
            StreamWorker::new(config, opener, analyzer, recognition, settings, stop).run();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::Feedback;
    use crate::pipeline::tests::{observation, recognition, RecordingSink};
    use image::RgbImage;
    use presence_core::{AnalyzerError, FaceRegion};
    use presence_hw::SourceError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Read {
        Frame,
        Fail,
    }

    struct FakeSource {
        reads: VecDeque<Read>,
        sequence: u64,
        released: Arc<AtomicUsize>,
    }

    impl VideoSource for FakeSource {
        fn read_frame(&mut self) -> Result<Frame, SourceError> {
            match self.reads.pop_front() {
                Some(Read::Frame) => {
                    self.sequence += 1;
                    Ok(Frame::new(RgbImage::new(8, 8), self.sequence))
                }
                Some(Read::Fail) | None => Err(SourceError::ReadFailed("no data".into())),
            }
        }
    }

    impl Drop for FakeSource {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Each open consumes one plan entry: `None` fails, `Some(reads)` opens a source.
    /// Once the plan is exhausted every open fails.
    #[derive(Default)]
    struct FakeOpener {
        plan: Mutex<VecDeque<Option<Vec<Read>>>>,
        opens: AtomicUsize,
        released: Arc<AtomicUsize>,
    }

    impl FakeOpener {
        fn new(plan: Vec<Option<Vec<Read>>>) -> Arc<Self> {
            Arc::new(Self {
                plan: Mutex::new(plan.into()),
                ..Self::default()
            })
        }
    }

    impl SourceOpener for FakeOpener {
        fn open(&self, _uri: &str) -> Result<Box<dyn VideoSource>, SourceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.plan.lock().unwrap().pop_front().flatten() {
                Some(reads) => Ok(Box::new(FakeSource {
                    reads: reads.into(),
                    sequence: 0,
                    released: Arc::clone(&self.released),
                })),
                None => Err(SourceError::Unavailable("camera offline".into())),
            }
        }
    }

    enum Analysis {
        Faces(Vec<FaceObservation>),
        Fail,
        Panic,
    }

    /// Plays back a script of analysis results; returns no faces once exhausted.
    struct ScriptedAnalyzer {
        script: VecDeque<Analysis>,
        repeat_faces: Option<Vec<FaceObservation>>,
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn analyze(&mut self, _image: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
            match self.script.pop_front() {
                Some(Analysis::Faces(faces)) => Ok(faces),
                Some(Analysis::Fail) => Err(AnalyzerError::Failed("model error".into())),
                Some(Analysis::Panic) => panic!("analyzer exploded"),
                None => Ok(self.repeat_faces.clone().unwrap_or_default()),
            }
        }
    }

    fn analyzer(script: Vec<Analysis>) -> Box<dyn FaceAnalyzer> {
        Box::new(ScriptedAnalyzer {
            script: script.into(),
            repeat_faces: None,
        })
    }

    #[derive(Default)]
    struct CapturingFeedback {
        annotations: Mutex<Vec<Vec<Annotation>>>,
    }

    impl Feedback for CapturingFeedback {
        fn recognized(&self, _identity: &Identity, _stream: &str) {}
        fn unknown(&self, _stream: &str) {}
        fn annotate(&self, _stream: &str, _frame: &Frame, annotations: &[Annotation]) {
            self.annotations.lock().unwrap().push(annotations.to_vec());
        }
    }

    fn settings(tolerance: u32) -> WorkerSettings {
        WorkerSettings {
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            read_failure_tolerance: tolerance,
            read_retry_delay: Duration::from_millis(1),
            detection_scale: 0.5,
            display_scale: 0.6,
        }
    }

    fn stream() -> StreamConfig {
        StreamConfig {
            label: "door".into(),
            uri: "rtsp://cam/live".into(),
        }
    }

    fn worker(
        opener: Arc<FakeOpener>,
        analyzer: Box<dyn FaceAnalyzer>,
        recognition: Arc<Recognition>,
        tolerance: u32,
    ) -> StreamWorker {
        StreamWorker::new(
            stream(),
            opener,
            analyzer,
            recognition,
            settings(tolerance),
            StopSignal::new(),
        )
    }

    fn quiet_recognition() -> Arc<Recognition> {
        Arc::new(recognition(
            Arc::new(RecordingSink::default()),
            Arc::new(crate::feedback::NoFeedback),
        ))
    }

    #[test]
    fn test_worker_can_move_to_its_thread() {
        fn assert_send<T: Send>() {}
        assert_send::<StreamWorker>();
        assert_send::<Box<dyn FaceAnalyzer>>();
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_connect_failures_back_off_then_stream() {
        let opener = FakeOpener::new(vec![None, None, Some(vec![Read::Frame])]);
        let mut w = worker(opener.clone(), analyzer(vec![]), quiet_recognition(), 10);

        let state = w.step(WorkerState::Connecting);
        assert!(matches!(state, WorkerState::Connecting));
        assert_eq!(w.backoff.peek(), Duration::from_millis(2));

        let state = w.step(state);
        assert!(matches!(state, WorkerState::Connecting));
        assert_eq!(w.backoff.peek(), Duration::from_millis(4));

        let state = w.step(state);
        assert!(matches!(state, WorkerState::Streaming(_)));
        assert_eq!(w.backoff.peek(), Duration::from_millis(1));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_read_failures_tolerated_up_to_threshold() {
        let opener = FakeOpener::new(vec![Some(vec![Read::Fail, Read::Fail, Read::Fail])]);
        let mut w = worker(opener.clone(), analyzer(vec![]), quiet_recognition(), 2);

        let mut state = w.step(WorkerState::Connecting);
        for expected_failures in 1..=2 {
            state = w.step(state);
            assert!(matches!(state, WorkerState::Streaming(_)));
            assert_eq!(w.read_failures, expected_failures);
        }
        state = w.step(state);
        assert!(matches!(state, WorkerState::Recovering));
        assert_eq!(opener.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_tolerance_recovers_on_first_failure() {
        let opener = FakeOpener::new(vec![Some(vec![Read::Fail])]);
        let mut w = worker(opener.clone(), analyzer(vec![]), quiet_recognition(), 0);

        let state = w.step(WorkerState::Connecting);
        let state = w.step(state);
        assert!(matches!(state, WorkerState::Recovering));
        assert_eq!(opener.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_successful_read_resets_failure_count() {
        let reads = vec![Read::Fail, Read::Frame, Read::Fail, Read::Fail];
        let opener = FakeOpener::new(vec![Some(reads)]);
        let mut w = worker(opener, analyzer(vec![]), quiet_recognition(), 1);

        let mut state = w.step(WorkerState::Connecting);
        state = w.step(state);
        assert_eq!(w.read_failures, 1);
        state = w.step(state);
        assert_eq!(w.read_failures, 0);
        state = w.step(state);
        assert!(matches!(state, WorkerState::Streaming(_)));
        state = w.step(state);
        assert!(matches!(state, WorkerState::Recovering));
    }

    #[test]
    fn test_detection_failure_recovers() {
        let opener = FakeOpener::new(vec![Some(vec![Read::Frame])]);
        let mut w = worker(
            opener.clone(),
            analyzer(vec![Analysis::Fail]),
            quiet_recognition(),
            10,
        );

        let state = w.step(WorkerState::Connecting);
        let state = w.step(state);
        assert!(matches!(state, WorkerState::Recovering));
        assert_eq!(opener.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_analyzer_panic_is_contained() {
        let opener = FakeOpener::new(vec![Some(vec![Read::Frame]), Some(vec![Read::Frame])]);
        let mut w = worker(
            opener.clone(),
            analyzer(vec![Analysis::Panic]),
            quiet_recognition(),
            10,
        );

        let state = w.step(WorkerState::Connecting);
        let state = w.step(state);
        assert!(matches!(state, WorkerState::Recovering));

        let state = w.step(state);
        assert!(matches!(state, WorkerState::Connecting));
        let state = w.step(state);
        assert!(matches!(state, WorkerState::Streaming(_)));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_recovery_doubles_backoff() {
        let opener = FakeOpener::new(vec![]);
        let mut w = worker(opener, analyzer(vec![]), quiet_recognition(), 10);

        let state = w.step(WorkerState::Recovering);
        assert!(matches!(state, WorkerState::Connecting));
        assert_eq!(w.backoff.peek(), Duration::from_millis(2));
    }

    #[test]
    fn test_stop_releases_open_source() {
        let opener = FakeOpener::new(vec![Some(vec![Read::Frame; 3])]);
        let mut w = worker(opener.clone(), analyzer(vec![]), quiet_recognition(), 10);

        let state = w.step(WorkerState::Connecting);
        assert!(matches!(state, WorkerState::Streaming(_)));
        w.stop.stop();
        let state = w.step(state);
        assert!(matches!(state, WorkerState::Stopped));
        assert_eq!(opener.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_regions_mapped_to_source_and_display_space() {
        let sink = Arc::new(RecordingSink::default());
        let feedback = Arc::new(CapturingFeedback::default());
        let recognition = Arc::new(recognition(sink.clone(), feedback.clone()));

        let mut face = observation(&[1.0, 0.0, 0.0]);
        face.region = FaceRegion {
            top: 1.0,
            right: 4.0,
            bottom: 3.0,
            left: 2.0,
        };
        let unknown = observation(&[0.0, 0.0, 1.0]);

        let opener = FakeOpener::new(vec![Some(vec![Read::Frame])]);
        let mut w = worker(
            opener,
            analyzer(vec![Analysis::Faces(vec![face, unknown])]),
            recognition,
            10,
        );
        let state = w.step(WorkerState::Connecting);
        let state = w.step(state);
        assert!(matches!(state, WorkerState::Streaming(_)));

        let frames = feedback.annotations.lock().unwrap();
        let annotations = &frames[0];
        assert_eq!(annotations.len(), 2);
        // Detection at 0.5 scale, display at 0.6: source edge 2.0 becomes 1.2.
        let region = annotations[0].region;
        assert!((region.top - 1.2).abs() < 1e-5);
        assert!((region.right - 4.8).abs() < 1e-5);
        assert!((region.bottom - 3.6).abs() < 1e-5);
        assert!((region.left - 2.4).abs() < 1e-5);
        assert_eq!(annotations[0].label, "Alice - Ops");
        assert_eq!(annotations[0].classification, Classification::Recognized);
        assert_eq!(annotations[1].classification, Classification::Unknown);

        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_run_reports_once_per_cooldown_and_stops() {
        let sink = Arc::new(RecordingSink::default());
        let recognition = Arc::new(recognition(sink.clone(), Arc::new(crate::feedback::NoFeedback)));
        let opener = FakeOpener::new(vec![None, Some(vec![Read::Frame; 20])]);
        let stop = StopSignal::new();

        let w = StreamWorker::new(
            stream(),
            opener.clone(),
            Box::new(ScriptedAnalyzer {
                script: VecDeque::new(),
                repeat_faces: Some(vec![observation(&[1.0, 0.1, 0.0])]),
            }),
            recognition,
            settings(2),
            stop.clone(),
        );
        let handle = std::thread::spawn(move || w.run());

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.events.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(50));
        stop.stop();
        handle.join().unwrap();

        assert_eq!(sink.events.lock().unwrap().len(), 1);
        assert!(opener.opens.load(Ordering::SeqCst) >= 2);
        assert_eq!(opener.released.load(Ordering::SeqCst), 1);
    }
}
