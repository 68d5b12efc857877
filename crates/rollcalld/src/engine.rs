//! Recognition engine: capture session ownership, lazy detector
//! initialization, and the recognize pipeline, running on a dedicated
//! OS thread behind an mpsc request channel.
//!
//! One recognition attempt is strictly sequential: grab a frame,
//! detect, extract, compare. The engine owns the capture-session
//! handle exclusively and releases it on every exit path — resolve,
//! cancel, camera failure, or shutdown.

use image::RgbaImage;
use rollcall_core::detector::{qualifying_people, DetectorError};
use rollcall_core::features::ExtractionError;
use rollcall_core::{Enrollment, FeatureExtractor, FirstMatchMatcher, Matcher, RegionDetector};
use rollcall_hw::{CameraError, CaptureSession, Frame};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("face detector unavailable: {0}")]
    DetectorInit(String),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("no face detected — position the face in the camera and retry")]
    NoFaceDetected,
    #[error("feature extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("no capture session active — start one first")]
    NoActiveCapture,
    #[error("captured frame is not a valid image")]
    BadFrame,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of one recognition attempt that ran to completion.
#[derive(Debug, Clone)]
pub enum RecognitionOutcome {
    /// A stored vector cleared the threshold. The camera has already
    /// been released when this surfaces.
    Resolved {
        student_id: String,
        name: String,
        similarity: f32,
    },
    /// Nobody matched. The camera stays on so the user can retry or
    /// fall back to manual selection.
    Unresolved,
}

/// Where recognition frames come from. Injected so the state machine
/// is testable without camera hardware; the stream type is the owned
/// capture handle and dropping it must release the device.
pub trait FrameSource: Send + 'static {
    type Stream: Send + 'static;

    fn start(&mut self) -> Result<Self::Stream, CameraError>;
    fn grab(&mut self, stream: &mut Self::Stream) -> Result<Frame, CameraError>;
}

/// Production source backed by a V4L2 capture session.
pub struct V4lSource {
    pub device: String,
    pub warmup_frames: usize,
}

impl FrameSource for V4lSource {
    type Stream = CaptureSession;

    fn start(&mut self) -> Result<CaptureSession, CameraError> {
        CaptureSession::open(&self.device, self.warmup_frames)
    }

    fn grab(&mut self, stream: &mut CaptureSession) -> Result<Frame, CameraError> {
        stream.grab()
    }
}

pub type DetectorFactory =
    Box<dyn FnMut() -> Result<Box<dyn RegionDetector + Send>, DetectorError> + Send>;

/// Lazily initialized detector slot. A failed load is remembered:
/// every later attempt in this session reports the same terminal
/// error instead of reloading the model.
enum DetectorSlot {
    Uninit,
    Ready(Box<dyn RegionDetector + Send>),
    Failed(String),
}

impl DetectorSlot {
    fn state_name(&self) -> &'static str {
        match self {
            DetectorSlot::Uninit => "not loaded",
            DetectorSlot::Ready(_) => "ready",
            DetectorSlot::Failed(_) => "failed",
        }
    }
}

/// The recognition state machine.
///
/// `stream` doubles as the state flag: `None` is Idle, `Some` is
/// Capturing. Detecting and Matching are transient phases of
/// [`recognize`](Self::recognize); the terminal states map to its
/// return value (Resolved/Unresolved outcome or error).
pub struct Orchestrator<S: FrameSource> {
    source: S,
    stream: Option<S::Stream>,
    detector: DetectorSlot,
    detector_factory: DetectorFactory,
    extractor: Box<dyn FeatureExtractor + Send>,
    matcher: FirstMatchMatcher,
    detection_threshold: f32,
    similarity_threshold: f32,
}

impl<S: FrameSource> Orchestrator<S> {
    pub fn new(
        source: S,
        detector_factory: DetectorFactory,
        extractor: Box<dyn FeatureExtractor + Send>,
        detection_threshold: f32,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            source,
            stream: None,
            detector: DetectorSlot::Uninit,
            detector_factory,
            extractor,
            matcher: FirstMatchMatcher,
            detection_threshold,
            similarity_threshold,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    pub fn detector_state(&self) -> &'static str {
        self.detector.state_name()
    }

    /// Idle → Capturing. An already-active session is released first;
    /// the hardware never carries two streams.
    pub fn start_capture(&mut self) -> Result<(), EngineError> {
        if self.stream.take().is_some() {
            tracing::debug!("releasing previous capture session");
        }
        self.stream = Some(self.source.start()?);
        tracing::info!("capture session started");
        Ok(())
    }

    /// Any state → Idle, releasing the camera immediately. No partial
    /// state survives.
    pub fn cancel(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("capture cancelled, camera released");
        }
    }

    /// Grab one frame for registration. Uses the active session if one
    /// exists, otherwise opens a fresh one; either way the camera is
    /// released once the photo is taken.
    pub fn snapshot(&mut self) -> Result<Frame, EngineError> {
        if self.stream.is_none() {
            self.stream = Some(self.source.start()?);
        }
        let result = match self.stream.as_mut() {
            Some(stream) => self.source.grab(stream),
            None => return Err(EngineError::NoActiveCapture),
        };
        self.stream = None;
        Ok(result?)
    }

    /// Run one recognition attempt against the enrolled set.
    ///
    /// Capturing → Detecting → Matching → Resolved | Unresolved. A
    /// camera failure releases the session (back to Idle); detector
    /// and extraction failures keep it so the user can retry.
    pub fn recognize(
        &mut self,
        enrolled: &[Enrollment],
    ) -> Result<RecognitionOutcome, EngineError> {
        let grabbed = match self.stream.as_mut() {
            Some(stream) => self.source.grab(stream),
            None => return Err(EngineError::NoActiveCapture),
        };
        let frame = match grabbed {
            Ok(frame) => frame,
            Err(e) => {
                // The stream is unusable; release the hardware.
                self.stream = None;
                return Err(e.into());
            }
        };

        let (width, height) = (frame.width, frame.height);
        let image =
            RgbaImage::from_raw(width, height, frame.data).ok_or(EngineError::BadFrame)?;

        let detections = self.detector()?.detect(&image)?;
        let people = qualifying_people(&detections, self.detection_threshold);
        tracing::debug!(
            detections = detections.len(),
            qualifying = people.len(),
            "frame detected"
        );

        let Some(face) = people.first() else {
            return Err(EngineError::NoFaceDetected);
        };

        let probe = self.extractor.extract(&image, Some(face))?;

        match self
            .matcher
            .find_match(&probe, enrolled, self.similarity_threshold)
        {
            Some(hit) => {
                // Release the camera before surfacing the result.
                self.stream = None;
                tracing::info!(
                    student = %hit.student_id,
                    similarity = hit.similarity,
                    "student recognized"
                );
                Ok(RecognitionOutcome::Resolved {
                    student_id: hit.student_id,
                    name: hit.name,
                    similarity: hit.similarity,
                })
            }
            None => {
                tracing::info!(enrolled = enrolled.len(), "no enrolled student matched");
                Ok(RecognitionOutcome::Unresolved)
            }
        }
    }

    /// Initialize the detector on first use and memoize the result,
    /// success or failure.
    fn detector(&mut self) -> Result<&mut (dyn RegionDetector + Send), EngineError> {
        if matches!(self.detector, DetectorSlot::Uninit) {
            self.detector = match (self.detector_factory)() {
                Ok(detector) => DetectorSlot::Ready(detector),
                Err(e) => {
                    tracing::error!(error = %e, "detector initialization failed; terminal for this session");
                    DetectorSlot::Failed(e.to_string())
                }
            };
        }
        match &mut self.detector {
            DetectorSlot::Ready(detector) => Ok(detector.as_mut()),
            DetectorSlot::Failed(msg) => Err(EngineError::DetectorInit(msg.clone())),
            DetectorSlot::Uninit => Err(EngineError::DetectorInit("not initialized".into())),
        }
    }
}

/// Engine state snapshot for the Status call.
#[derive(Debug, Clone, Copy)]
pub struct EngineStatus {
    pub capturing: bool,
    pub detector: &'static str,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    StartCapture {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Recognize {
        enrolled: Vec<Enrollment>,
        reply: oneshot::Sender<Result<RecognitionOutcome, EngineError>>,
    },
    CancelCapture {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<Frame, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn start_capture(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::StartCapture { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn recognize(
        &self,
        enrolled: Vec<Enrollment>,
    ) -> Result<RecognitionOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize { enrolled, reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn cancel_capture(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::CancelCapture { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<Frame, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Snapshot { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Nothing heavy happens at spawn: the camera opens per capture
/// session and the detection model loads on first use, so a missing
/// camera or model only fails the operations that need them.
pub fn spawn_engine<S: FrameSource>(
    source: S,
    detector_factory: DetectorFactory,
    extractor: Box<dyn FeatureExtractor + Send>,
    detection_threshold: f32,
    similarity_threshold: f32,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut orchestrator = Orchestrator::new(
                source,
                detector_factory,
                extractor,
                detection_threshold,
                similarity_threshold,
            );

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::StartCapture { reply } => {
                        let _ = reply.send(orchestrator.start_capture());
                    }
                    EngineRequest::Recognize { enrolled, reply } => {
                        let _ = reply.send(orchestrator.recognize(&enrolled));
                    }
                    EngineRequest::CancelCapture { reply } => {
                        orchestrator.cancel();
                        let _ = reply.send(());
                    }
                    EngineRequest::Snapshot { reply } => {
                        let _ = reply.send(orchestrator.snapshot());
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(EngineStatus {
                            capturing: orchestrator.is_capturing(),
                            detector: orchestrator.detector_state(),
                        });
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{DetectionBox, FeatureVector, PixelSliceExtractor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Frame stream that decrements the shared active counter on drop,
    /// standing in for hardware release.
    struct MockStream {
        active: Arc<AtomicUsize>,
    }

    impl Drop for MockStream {
        fn drop(&mut self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct MockSource {
        opens: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        fail_open: bool,
        fail_grab: bool,
        frame_color: [u8; 4],
    }

    impl MockSource {
        fn new() -> Self {
            Self {
                opens: Arc::new(AtomicUsize::new(0)),
                active: Arc::new(AtomicUsize::new(0)),
                fail_open: false,
                fail_grab: false,
                frame_color: [100, 150, 200, 255],
            }
        }
    }

    impl FrameSource for MockSource {
        type Stream = MockStream;

        fn start(&mut self) -> Result<MockStream, CameraError> {
            if self.fail_open {
                return Err(CameraError::DeviceNotFound("/dev/null".into()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_add(1, Ordering::SeqCst);
            Ok(MockStream {
                active: self.active.clone(),
            })
        }

        fn grab(&mut self, _stream: &mut MockStream) -> Result<Frame, CameraError> {
            if self.fail_grab {
                return Err(CameraError::CaptureFailed("timeout".into()));
            }
            let (width, height) = (64u32, 64u32);
            let mut data = Vec::with_capacity((width * height * 4) as usize);
            for _ in 0..width * height {
                data.extend_from_slice(&self.frame_color);
            }
            Ok(Frame {
                data,
                width,
                height,
                timestamp: std::time::Instant::now(),
                sequence: 0,
            })
        }
    }

    /// Detector stub returning a fixed detection list.
    struct StubDetector {
        boxes: Vec<DetectionBox>,
    }

    impl RegionDetector for StubDetector {
        fn detect(&mut self, _image: &RgbaImage) -> Result<Vec<DetectionBox>, DetectorError> {
            Ok(self.boxes.clone())
        }
    }

    fn person_box() -> DetectionBox {
        DetectionBox {
            xmin: 8.0,
            ymin: 8.0,
            xmax: 40.0,
            ymax: 40.0,
            label: "person".into(),
            score: 0.9,
        }
    }

    fn stub_factory(boxes: Vec<DetectionBox>, calls: Arc<AtomicUsize>) -> DetectorFactory {
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubDetector {
                boxes: boxes.clone(),
            }) as Box<dyn RegionDetector + Send>)
        })
    }

    fn failing_factory(calls: Arc<AtomicUsize>) -> DetectorFactory {
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DetectorError::ModelNotFound("yolov5s.onnx".into()))
        })
    }

    fn orchestrator(
        source: MockSource,
        factory: DetectorFactory,
    ) -> Orchestrator<MockSource> {
        Orchestrator::new(source, factory, Box::new(PixelSliceExtractor), 0.5, 0.8)
    }

    /// The vector the extractor produces from the mock frame and the
    /// stub person box: a solid-color crop.
    fn enrolled_vector(color: [u8; 4]) -> FeatureVector {
        let mut values = Vec::with_capacity(128);
        while values.len() < 128 {
            values.extend(color.iter().map(|&b| b as f32));
        }
        FeatureVector::new(values)
    }

    fn enrollment(id: &str, features: Option<FeatureVector>) -> Enrollment {
        Enrollment {
            student_id: id.into(),
            name: format!("student-{id}"),
            features,
        }
    }

    #[test]
    fn test_recognize_requires_active_capture() {
        let mut orch = orchestrator(
            MockSource::new(),
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
        );
        let result = orch.recognize(&[]);
        assert!(matches!(result, Err(EngineError::NoActiveCapture)));
    }

    #[test]
    fn test_resolved_releases_camera() {
        let source = MockSource::new();
        let active = source.active.clone();
        let color = source.frame_color;
        let mut orch = orchestrator(
            source,
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
        );

        orch.start_capture().unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 1);

        let enrolled = vec![enrollment("alice", Some(enrolled_vector(color)))];
        let outcome = orch.recognize(&enrolled).unwrap();

        match outcome {
            RecognitionOutcome::Resolved { student_id, similarity, .. } => {
                assert_eq!(student_id, "alice");
                assert!(similarity > 0.99);
            }
            RecognitionOutcome::Unresolved => panic!("expected a match"),
        }
        // Camera must be released before the result surfaces.
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(!orch.is_capturing());
    }

    #[test]
    fn test_unresolved_keeps_camera_active() {
        let source = MockSource::new();
        let active = source.active.clone();
        let mut orch = orchestrator(
            source,
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
        );

        orch.start_capture().unwrap();
        // Stored vector of a different length can never match.
        let enrolled = vec![enrollment("alice", Some(FeatureVector::new(vec![1.0, 2.0])))];
        let outcome = orch.recognize(&enrolled).unwrap();

        assert!(matches!(outcome, RecognitionOutcome::Unresolved));
        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert!(orch.is_capturing());

        orch.cancel();
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_match_wins_end_to_end() {
        let source = MockSource::new();
        let color = source.frame_color;
        let mut orch = orchestrator(
            source,
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
        );

        orch.start_capture().unwrap();
        // Both entries hold the identical matching vector; the scan
        // must stop at the first.
        let enrolled = vec![
            enrollment("first", Some(enrolled_vector(color))),
            enrollment("second", Some(enrolled_vector(color))),
        ];
        let outcome = orch.recognize(&enrolled).unwrap();
        match outcome {
            RecognitionOutcome::Resolved { student_id, .. } => assert_eq!(student_id, "first"),
            RecognitionOutcome::Unresolved => panic!("expected a match"),
        }
    }

    #[test]
    fn test_no_qualifying_person_aborts_before_matching() {
        let source = MockSource::new();
        let active = source.active.clone();
        // Only a low-score person and a confident chair in frame.
        let boxes = vec![
            DetectionBox {
                score: 0.3,
                ..person_box()
            },
            DetectionBox {
                label: "chair".into(),
                ..person_box()
            },
        ];
        let mut orch = orchestrator(source, stub_factory(boxes, Arc::new(AtomicUsize::new(0))));

        orch.start_capture().unwrap();
        let result = orch.recognize(&[]);
        assert!(matches!(result, Err(EngineError::NoFaceDetected)));
        // Recoverable: the user repositions, the camera stays on.
        assert_eq!(active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detector_init_failure_is_terminal_and_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut orch = orchestrator(MockSource::new(), failing_factory(calls.clone()));

        orch.start_capture().unwrap();
        let first = orch.recognize(&[]);
        assert!(matches!(first, Err(EngineError::DetectorInit(_))));

        let second = orch.recognize(&[]);
        assert!(matches!(second, Err(EngineError::DetectorInit(_))));

        // The factory ran once; the failure is remembered, not retried.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.detector_state(), "failed");
    }

    #[test]
    fn test_detector_loaded_once_across_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = MockSource::new();
        let color = source.frame_color;
        let mut orch = orchestrator(source, stub_factory(vec![person_box()], calls.clone()));

        let enrolled = vec![enrollment("alice", Some(enrolled_vector(color)))];
        orch.start_capture().unwrap();
        orch.recognize(&enrolled).unwrap();
        orch.start_capture().unwrap();
        orch.recognize(&enrolled).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.detector_state(), "ready");
    }

    #[test]
    fn test_restart_capture_releases_prior_stream() {
        let source = MockSource::new();
        let opens = source.opens.clone();
        let active = source.active.clone();
        let mut orch = orchestrator(
            source,
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
        );

        orch.start_capture().unwrap();
        orch.start_capture().unwrap();

        assert_eq!(opens.load(Ordering::SeqCst), 2);
        // Never two concurrent streams.
        assert_eq!(active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_camera_failure_during_recognize_releases_stream() {
        let mut source = MockSource::new();
        source.fail_grab = true;
        let active = source.active.clone();
        let mut orch = orchestrator(
            source,
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
        );

        orch.start_capture().unwrap();
        let result = orch.recognize(&[]);
        assert!(matches!(result, Err(EngineError::Camera(_))));
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(!orch.is_capturing());
    }

    #[test]
    fn test_camera_open_failure_surfaces() {
        let mut source = MockSource::new();
        source.fail_open = true;
        let mut orch = orchestrator(
            source,
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
        );
        assert!(matches!(
            orch.start_capture(),
            Err(EngineError::Camera(CameraError::DeviceNotFound(_)))
        ));
        assert!(!orch.is_capturing());
    }

    #[test]
    fn test_snapshot_releases_camera() {
        let source = MockSource::new();
        let active = source.active.clone();
        let mut orch = orchestrator(
            source,
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
        );

        let frame = orch.snapshot().unwrap();
        assert_eq!(frame.width, 64);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(!orch.is_capturing());
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let mut orch = orchestrator(
            MockSource::new(),
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
        );
        orch.cancel();
        assert!(!orch.is_capturing());
    }

    #[tokio::test]
    async fn test_engine_thread_roundtrip() {
        let source = MockSource::new();
        let color = source.frame_color;
        let handle = spawn_engine(
            source,
            stub_factory(vec![person_box()], Arc::new(AtomicUsize::new(0))),
            Box::new(PixelSliceExtractor),
            0.5,
            0.8,
        );

        let status = handle.status().await.unwrap();
        assert!(!status.capturing);
        assert_eq!(status.detector, "not loaded");

        handle.start_capture().await.unwrap();
        let outcome = handle
            .recognize(vec![enrollment("alice", Some(enrolled_vector(color)))])
            .await
            .unwrap();
        assert!(matches!(outcome, RecognitionOutcome::Resolved { .. }));

        handle.cancel_capture().await.unwrap();
        let status = handle.status().await.unwrap();
        assert!(!status.capturing);
        assert_eq!(status.detector, "ready");
    }
}
