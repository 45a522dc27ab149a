#![allow(dead_code)]

use face_lock::camera::FrameSource;
use face_lock::common::{ActuatorError, DetectorError};
use face_lock::core::{FaceBox, FaceDetector, FaceRecognizer, Notifier, TemplateEnroller, TracingNotifier, Verdict};
use face_lock::hardware::{LockActuator, LockState, OutputPin, TimedLock, UnlockPulse};
use face_lock::storage::{PersistentStore, StoreOptions, User};
use face_lock::{AppContext, Components, Config, FaceLockError};
use image::DynamicImage;
use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Output pin that records every level it is driven to.
#[derive(Clone, Default)]
pub struct RecordingPin {
    pub levels: Arc<Mutex<Vec<(bool, Instant)>>>,
}

impl RecordingPin {
    pub fn transitions(&self) -> Vec<bool> {
        self.levels.lock().unwrap().iter().map(|(level, _)| *level).collect()
    }

    pub fn pulses(&self) -> usize {
        self.transitions().iter().filter(|level| **level).count()
    }
}

impl OutputPin for RecordingPin {
    fn set_high(&mut self) -> Result<(), ActuatorError> {
        self.levels.lock().unwrap().push((true, Instant::now()));
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), ActuatorError> {
        self.levels.lock().unwrap().push((false, Instant::now()));
        Ok(())
    }
}

/// Real timed lock on a recording pin that also counts successful `unlock()` calls.
pub struct CountingActuator {
    pub inner: TimedLock,
    pub pin: RecordingPin,
    unlocks: AtomicUsize,
    locks: AtomicUsize,
}

impl CountingActuator {
    pub fn new(duration: Duration) -> Self {
        let pin = RecordingPin::default();
        Self {
            inner: TimedLock::new(Box::new(pin.clone()), duration),
            pin,
            unlocks: AtomicUsize::new(0),
            locks: AtomicUsize::new(0),
        }
    }

    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }
}

impl LockActuator for CountingActuator {
    fn unlock(&self) -> Result<UnlockPulse, ActuatorError> {
        let pulse = self.inner.unlock()?;
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(pulse)
    }

    fn lock(&self) -> Result<(), ActuatorError> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        self.inner.lock()
    }

    fn state(&self) -> LockState {
        self.inner.state()
    }
}

/// Detector that reports one fixed face on every frame, or nothing.
pub struct ScriptedDetector {
    faces: Mutex<VecDeque<Result<Vec<FaceBox>, DetectorError>>>,
    fallback: Vec<FaceBox>,
    pub calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn always(faces: Vec<FaceBox>) -> Self {
        Self {
            faces: Mutex::new(VecDeque::new()),
            fallback: faces,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn one_face() -> Self {
        Self::always(vec![face_box()])
    }

    pub fn script(results: Vec<Result<Vec<FaceBox>, DetectorError>>) -> Self {
        Self {
            faces: Mutex::new(results.into()),
            fallback: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&self, _frame: &DynamicImage) -> Result<Vec<FaceBox>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.faces.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Recognizer returning queued (label, confidence) pairs, then a fallback.
pub struct ScriptedRecognizer {
    verdicts: Mutex<VecDeque<(Option<i64>, f32)>>,
    fallback: (Option<i64>, f32),
}

impl ScriptedRecognizer {
    pub fn new(verdicts: Vec<(Option<i64>, f32)>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            fallback: (None, 99.0),
        }
    }

    pub fn always(label: Option<i64>, confidence: f32) -> Self {
        Self {
            verdicts: Mutex::new(VecDeque::new()),
            fallback: (label, confidence),
        }
    }
}

impl FaceRecognizer for ScriptedRecognizer {
    fn recognize(&self, _frame: &DynamicImage, face: &FaceBox) -> Result<Verdict, DetectorError> {
        let (label, confidence) = self.verdicts.lock().unwrap().pop_front().unwrap_or(self.fallback);
        Ok(Verdict {
            label,
            confidence,
            face: Some(face.clone()),
        })
    }
}

/// Enroller that remembers which users it was asked to refresh.
#[derive(Default)]
pub struct RecordingEnroller {
    pub refreshed: Mutex<Vec<i64>>,
}

impl TemplateEnroller for RecordingEnroller {
    fn refresh(&self, user: &User) -> Result<(), DetectorError> {
        self.refreshed.lock().unwrap().push(user.label);
        Ok(())
    }
}

/// Camera that serves a fixed number of blank frames, then raises `shutdown`.
pub struct FakeFrames {
    remaining: usize,
    failures_first: usize,
    shutdown: Arc<AtomicBool>,
}

impl FakeFrames {
    pub fn new(frames: usize, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            remaining: frames,
            failures_first: 0,
            shutdown,
        }
    }

    pub fn failing_first(mut self, failures: usize) -> Self {
        self.failures_first = failures;
        self
    }
}

impl FrameSource for FakeFrames {
    fn next_frame(&mut self) -> face_lock::Result<DynamicImage> {
        if self.failures_first > 0 {
            self.failures_first -= 1;
            return Err(FaceLockError::Camera("device busy".into()));
        }
        if self.remaining == 0 {
            self.shutdown.store(true, Ordering::SeqCst);
            return Err(FaceLockError::Camera("no more frames".into()));
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            self.shutdown.store(true, Ordering::SeqCst);
        }
        Ok(DynamicImage::new_luma8(64, 48))
    }
}

pub fn face_box() -> FaceBox {
    FaceBox {
        x1: 10.0,
        y1: 8.0,
        x2: 40.0,
        y2: 38.0,
        confidence: 0.95,
    }
}

/// Config rooted in `dir`: threshold 40, lower is better, every frame evaluated.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.recognition.frame_skip = 1;
    config.recognition.confidence_threshold = 40.0;
    config.storage.database_path = dir.join("smartlock.db");
    config.storage.access_images_dir = dir.join("access_images");
    config.storage.user_images_dir = dir.join("user_images");
    config.storage.access_log_file = dir.join("access_log.txt");
    config.admin.socket_path = dir.join("admin.sock");
    config.remote.socket_path = dir.join("remote.sock");
    config
}

pub struct Harness {
    pub context: AppContext,
    pub actuator: Arc<CountingActuator>,
    pub enroller: Arc<RecordingEnroller>,
    pub dir: PathBuf,
}

pub fn harness(
    dir: &Path,
    config: Config,
    detector: Arc<dyn FaceDetector>,
    recognizer: Arc<dyn FaceRecognizer>,
) -> Harness {
    let actuator = Arc::new(CountingActuator::new(Duration::from_millis(
        config.lock.unlock_duration_ms,
    )));
    harness_with_notifier(dir, config, detector, recognizer, actuator, Arc::new(TracingNotifier))
}

pub fn harness_with_notifier(
    dir: &Path,
    config: Config,
    detector: Arc<dyn FaceDetector>,
    recognizer: Arc<dyn FaceRecognizer>,
    actuator: Arc<CountingActuator>,
    notifier: Arc<dyn Notifier>,
) -> Harness {
    let options = StoreOptions::default();
    let store = PersistentStore::open(&config.storage.database_path, &options).unwrap();
    let enroller = Arc::new(RecordingEnroller::default());

    let components = Components {
        actuator: actuator.clone(),
        detector,
        recognizer,
        enroller: enroller.clone(),
        notifier,
    };
    let context = AppContext::assemble(config, store, components).unwrap();
    Harness {
        context,
        actuator,
        enroller,
        dir: dir.to_path_buf(),
    }
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Jpeg(90))
        .unwrap();
    bytes
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}
