use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded};
use image::RgbaImage;
use ml_core::{BoundingBox, Detector, DetectorEnv, DetectorError, DetectorOutput};
use video_ingest::{CaptureError, Frame, FrameFormat, FrameSource, FrameStream, ReplaySource, Rotation};
use vision::{Admission, DetectionListener, FrameGate, Pipeline, PipelineError, PresentationQueue};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

enum Reply {
    Boxes(Vec<BoundingBox>, Duration),
    Fail,
    Panic,
}

/// Shared view of what the fake detector observed.
#[derive(Default)]
struct Observed {
    setups: AtomicUsize,
    clears: AtomicUsize,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    sizes: Mutex<Vec<(u32, u32)>>,
}

/// Detector that replays scripted replies and can be held inside `detect`
/// until the test releases it.
struct ScriptedDetector {
    observed: Arc<Observed>,
    replies: VecDeque<Reply>,
    gate: Option<(Sender<()>, Receiver<()>)>,
    fail_setup: bool,
}

impl ScriptedDetector {
    fn new(replies: Vec<Reply>) -> (Self, Arc<Observed>) {
        let observed = Arc::new(Observed::default());
        let detector = Self {
            observed: observed.clone(),
            replies: replies.into(),
            gate: None,
            fail_setup: false,
        };
        (detector, observed)
    }

    /// Block every `detect` call: announce entry on the first channel and
    /// wait for a release on the second.
    fn gated(mut self) -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = bounded(8);
        let (release_tx, release_rx) = bounded(8);
        self.gate = Some((entered_tx, release_rx));
        (self, entered_rx, release_tx)
    }
}

impl Detector for ScriptedDetector {
    fn setup(&mut self, _env: &DetectorEnv) -> Result<(), DetectorError> {
        self.observed.setups.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup {
            return Err(DetectorError::Setup("model missing".into()));
        }
        Ok(())
    }

    fn detect(&mut self, image: &RgbaImage) -> Result<DetectorOutput, DetectorError> {
        let observed = &self.observed;
        let now_active = observed.active.fetch_add(1, Ordering::SeqCst) + 1;
        observed.max_active.fetch_max(now_active, Ordering::SeqCst);
        observed.calls.fetch_add(1, Ordering::SeqCst);
        observed
            .sizes
            .lock()
            .expect("sizes lock")
            .push(image.dimensions());

        if let Some((entered, release)) = self.gate.as_ref() {
            let _ = entered.send(());
            let _ = release.recv_timeout(WAIT);
        }

        let reply = self.replies.pop_front();
        observed.active.fetch_sub(1, Ordering::SeqCst);
        match reply {
            Some(Reply::Boxes(boxes, elapsed)) => Ok(DetectorOutput { boxes, elapsed }),
            Some(Reply::Fail) => Err(DetectorError::Inference("tensor shape mismatch".into())),
            Some(Reply::Panic) => panic!("detector crashed"),
            None => Ok(DetectorOutput::default()),
        }
    }

    fn clear(&mut self) {
        self.observed.clears.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, PartialEq)]
enum Event {
    Detect(Vec<f32>, u64),
    Empty,
}

#[derive(Default)]
struct Recorder {
    events: Vec<Event>,
}

impl DetectionListener for Recorder {
    fn on_detect(&mut self, boxes: &[BoundingBox], elapsed_ms: u64) {
        let confidences = boxes.iter().map(|b| b.confidence).collect();
        self.events.push(Event::Detect(confidences, elapsed_ms));
    }

    fn on_empty_detect(&mut self) {
        self.events.push(Event::Empty);
    }
}

struct BrokenCamera;

impl FrameSource for BrokenCamera {
    fn open(&mut self) -> Result<FrameStream, CaptureError> {
        Err(CaptureError::Open {
            uri: "/dev/video9".into(),
        })
    }

    fn describe(&self) -> String {
        "camera /dev/video9".into()
    }
}

fn frame(id: u64, width: u32, height: u32) -> Frame {
    let len = (width * height * 4) as usize;
    Frame::new(id, width, height, FrameFormat::Rgba8, vec![0; len])
}

fn two_boxes() -> Reply {
    Reply::Boxes(
        vec![
            BoundingBox::new(0, "person", 0.9, [0.1, 0.1, 0.4, 0.6]),
            BoundingBox::new(2, "car", 0.4, [0.5, 0.5, 0.9, 0.9]),
        ],
        Duration::from_millis(37),
    )
}

fn started(detector: ScriptedDetector) -> (Pipeline, PresentationQueue, FrameGate) {
    let (mut pipeline, queue) = Pipeline::new(Box::new(detector), DetectorEnv::default());
    pipeline.setup_detector().expect("detector setup");
    let gate = pipeline.frame_gate().expect("worker running");
    (pipeline, queue, gate)
}

fn offer_when_idle(gate: &FrameGate, frame: Frame) -> Admission {
    let deadline = Instant::now() + WAIT;
    while gate.is_busy() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    gate.offer(frame)
}

#[test]
fn rotated_frame_yields_single_detection_in_detector_order() {
    let (detector, observed) = ScriptedDetector::new(vec![two_boxes()]);
    let (mut pipeline, mut queue) = Pipeline::new(Box::new(detector), DetectorEnv::default());
    let mut source = ReplaySource::new(
        "portrait",
        vec![frame(1, 640, 480).with_rotation(Rotation::Deg90)],
        Duration::ZERO,
    );

    pipeline.start(&mut source).expect("source binds");
    let mut recorder = Recorder::default();
    assert_eq!(queue.pump_timeout(&mut recorder, WAIT), 1);
    assert_eq!(queue.pump_timeout(&mut recorder, QUIET), 0);

    assert_eq!(recorder.events, vec![Event::Detect(vec![0.9, 0.4], 37)]);
    assert_eq!(observed.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*observed.sizes.lock().expect("sizes lock"), vec![(480, 640)]);

    pipeline.stop();
    assert_eq!(observed.setups.load(Ordering::SeqCst), 1);
    assert_eq!(observed.clears.load(Ordering::SeqCst), 1);
}

#[test]
fn empty_box_list_notifies_empty() {
    let (detector, _observed) =
        ScriptedDetector::new(vec![Reply::Boxes(Vec::new(), Duration::from_millis(5))]);
    let (_pipeline, mut queue, gate) = started(detector);

    assert_eq!(gate.offer(frame(1, 32, 24)), Admission::Accepted);
    let mut recorder = Recorder::default();
    assert_eq!(queue.pump_timeout(&mut recorder, WAIT), 1);
    assert_eq!(recorder.events, vec![Event::Empty]);
}

#[test]
fn frames_arriving_while_busy_are_dropped_without_dispatch() {
    let (detector, observed) = ScriptedDetector::new(vec![two_boxes()]);
    let (detector, entered, release) = detector.gated();
    let (pipeline, mut queue, gate) = started(detector);

    assert_eq!(gate.offer(frame(1, 64, 48)), Admission::Accepted);
    entered.recv_timeout(WAIT).expect("detector entered");
    assert!(gate.is_busy());

    let burst = thread::scope(|scope| {
        let workers: Vec<_> = (2..6)
            .map(|id| {
                let gate = gate.clone();
                scope.spawn(move || gate.offer(frame(id, 64, 48)))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("offer thread"))
            .collect::<Vec<_>>()
    });
    assert!(burst.iter().all(|admission| *admission == Admission::DroppedBusy));

    release.send(()).expect("release detector");
    let mut recorder = Recorder::default();
    assert_eq!(queue.pump_timeout(&mut recorder, WAIT), 1);
    assert_eq!(queue.pump_timeout(&mut recorder, QUIET), 0);

    assert_eq!(observed.calls.load(Ordering::SeqCst), 1);
    assert_eq!(observed.max_active.load(Ordering::SeqCst), 1);
    let stats = pipeline.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.dropped_busy, 4);
    assert_eq!(stats.notifications(), 1);
}

#[test]
fn sustained_offers_never_overlap_detector_calls() {
    let replies = (0..200).map(|_| Reply::Boxes(Vec::new(), Duration::ZERO)).collect();
    let (detector, observed) = ScriptedDetector::new(replies);
    let (pipeline, mut queue, gate) = started(detector);

    let producers: Vec<_> = (0..4)
        .map(|worker| {
            let gate = gate.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    gate.offer(frame(worker * 100 + i, 16, 16));
                    thread::yield_now();
                }
            })
        })
        .collect();

    let mut recorder = Recorder::default();
    let consumer_deadline = Instant::now() + WAIT;
    while producers.iter().any(|p| !p.is_finished()) && Instant::now() < consumer_deadline {
        queue.pump_timeout(&mut recorder, Duration::from_millis(5));
    }
    for producer in producers {
        producer.join().expect("producer");
    }
    while queue.pump_timeout(&mut recorder, QUIET) > 0 {}

    let stats = pipeline.stats();
    assert_eq!(observed.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(stats.accepted + stats.dropped_busy, 200);
    assert_eq!(stats.detector_calls, stats.accepted);
    assert_eq!(recorder.events.len() as u64, stats.accepted);
}

#[test]
fn detector_failures_become_empty_and_processing_continues() {
    let (detector, observed) = ScriptedDetector::new(vec![Reply::Fail, Reply::Panic, two_boxes()]);
    let (pipeline, mut queue, gate) = started(detector);
    let mut recorder = Recorder::default();

    for id in 1..=3 {
        assert_eq!(offer_when_idle(&gate, frame(id, 20, 10)), Admission::Accepted);
        assert_eq!(queue.pump_timeout(&mut recorder, WAIT), 1);
    }

    assert_eq!(
        recorder.events,
        vec![Event::Empty, Event::Empty, Event::Detect(vec![0.9, 0.4], 37)]
    );
    assert_eq!(observed.calls.load(Ordering::SeqCst), 3);
    assert_eq!(pipeline.stats().detector_failures, 2);
}

#[test]
fn invalid_frame_is_dropped_without_notification() {
    let (detector, observed) = ScriptedDetector::new(vec![two_boxes()]);
    let (pipeline, mut queue, gate) = started(detector);
    let mut recorder = Recorder::default();

    let truncated = Frame::new(1, 10, 10, FrameFormat::Rgba8, vec![0; 399]);
    assert_eq!(gate.offer(truncated), Admission::Accepted);
    assert_eq!(queue.pump_timeout(&mut recorder, QUIET), 0);

    assert_eq!(offer_when_idle(&gate, frame(2, 10, 10)), Admission::Accepted);
    assert_eq!(queue.pump_timeout(&mut recorder, WAIT), 1);

    assert_eq!(recorder.events, vec![Event::Detect(vec![0.9, 0.4], 37)]);
    assert_eq!(observed.calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.stats().invalid, 1);
}

#[test]
fn stop_is_idempotent_and_safe_before_start() {
    let (detector, observed) = ScriptedDetector::new(Vec::new());
    let (mut idle, _queue) = Pipeline::new(Box::new(detector), DetectorEnv::default());
    idle.stop();
    idle.stop();
    assert!(!idle.is_running());
    assert_eq!(observed.setups.load(Ordering::SeqCst), 0);
    assert_eq!(observed.clears.load(Ordering::SeqCst), 0);

    let (detector, observed) = ScriptedDetector::new(Vec::new());
    let (mut pipeline, _queue, gate) = started(detector);
    assert!(pipeline.is_running());
    pipeline.stop();
    pipeline.stop();
    drop(pipeline);

    assert_eq!(observed.setups.load(Ordering::SeqCst), 1);
    assert_eq!(observed.clears.load(Ordering::SeqCst), 1);
    assert_eq!(gate.offer(frame(1, 8, 8)), Admission::Closed);
    assert_eq!(observed.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn stop_waits_for_in_flight_detection() {
    let (detector, observed) = ScriptedDetector::new(vec![two_boxes()]);
    let (detector, entered, release) = detector.gated();
    let (mut pipeline, _queue, gate) = started(detector);

    assert_eq!(gate.offer(frame(1, 8, 8)), Admission::Accepted);
    entered.recv_timeout(WAIT).expect("detector entered");

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        release.send(()).expect("release detector");
    });
    pipeline.stop();
    releaser.join().expect("releaser");

    assert_eq!(observed.active.load(Ordering::SeqCst), 0);
    assert_eq!(observed.clears.load(Ordering::SeqCst), 1);
}

#[test]
fn start_after_stop_is_rejected() {
    let (detector, _observed) = ScriptedDetector::new(Vec::new());
    let (mut pipeline, _queue) = Pipeline::new(Box::new(detector), DetectorEnv::default());
    pipeline.stop();

    let mut source = ReplaySource::new("late", vec![frame(1, 8, 8)], Duration::ZERO);
    assert!(matches!(pipeline.start(&mut source), Err(PipelineError::Stopped)));
    assert_eq!(source.remaining(), 1);
}

#[test]
fn source_binding_failure_is_returned_and_rebinding_works() {
    let (detector, observed) = ScriptedDetector::new(vec![two_boxes()]);
    let (mut pipeline, mut queue) = Pipeline::new(Box::new(detector), DetectorEnv::default());

    let err = pipeline.start(&mut BrokenCamera).expect_err("binding must fail");
    assert!(matches!(
        err,
        PipelineError::SourceBinding {
            cause: CaptureError::Open { .. },
            ..
        }
    ));
    assert!(!pipeline.is_bound());
    assert!(pipeline.is_running());

    let mut source = ReplaySource::new("retry", vec![frame(1, 16, 16)], Duration::ZERO);
    pipeline.start(&mut source).expect("second bind succeeds");
    let mut recorder = Recorder::default();
    assert_eq!(queue.pump_timeout(&mut recorder, WAIT), 1);
    assert_eq!(observed.setups.load(Ordering::SeqCst), 1);
}

#[test]
fn detector_setup_failure_is_reported() {
    let (mut detector, observed) = ScriptedDetector::new(Vec::new());
    detector.fail_setup = true;
    let (mut pipeline, _queue) = Pipeline::new(Box::new(detector), DetectorEnv::default());

    let mut source = ReplaySource::new("never", vec![frame(1, 8, 8)], Duration::ZERO);
    assert!(matches!(
        pipeline.start(&mut source),
        Err(PipelineError::DetectorSetup(DetectorError::Setup(_)))
    ));
    assert!(!pipeline.is_running());
    assert_eq!(observed.calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.remaining(), 1);
}
