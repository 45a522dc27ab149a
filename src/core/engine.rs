use crate::camera::FrameSource;
use crate::common::{DetectorError, FaceLockError, Result, StorageError};
use crate::core::alerts::{DenialTracker, Notifier};
use crate::core::detector::FaceBox;
use crate::core::pipeline::{AdmissionPolicy, RecognitionPipeline};
use crate::core::recognizer::Verdict;
use crate::hardware::{LockActuator, LockState};
use crate::storage::{AccessEvent, AccessLogger, EventSource};
use image::{DynamicImage, ImageOutputFormat, Rgb};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Consecutive capture failures tolerated before the loop gives up on the camera.
const MAX_CAMERA_FAILURES: u32 = 50;
const CAMERA_RETRY: Duration = Duration::from_millis(100);
const JPEG_QUALITY: u8 = 85;
const NON_FINITE_CONFIDENCE: &str = "recognizer returned a non-finite confidence";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Evaluating,
    Admitting,
    Denying,
}

/// Result of one pass through the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NoFace,
    Admitted(AccessEvent),
    Denied(AccessEvent),
}

impl Decision {
    pub fn event(&self) -> Option<&AccessEvent> {
        match self {
            Decision::NoFace => None,
            Decision::Admitted(event) | Decision::Denied(event) => Some(event),
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted(_))
    }
}

/// Central state machine: verdict in, lock actuation and access record out.
///
/// Every admission pairs one `unlock()` call with one admitted record, whichever
/// thread asked for it. Remote commands never wait on an in-flight recognition
/// decision; the actuator serializes itself.
pub struct AccessControlEngine {
    actuator: Arc<dyn LockActuator>,
    logger: Arc<AccessLogger>,
    policy: AdmissionPolicy,
    state: Mutex<EngineState>,
    denials: Mutex<DenialTracker>,
    notifier: Arc<dyn Notifier>,
}

impl AccessControlEngine {
    pub fn new(
        actuator: Arc<dyn LockActuator>,
        logger: Arc<AccessLogger>,
        policy: AdmissionPolicy,
        denials: DenialTracker,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            actuator,
            logger,
            policy,
            state: Mutex::new(EngineState::Idle),
            denials: Mutex::new(denials),
            notifier,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_state(&self) -> LockState {
        self.actuator.state()
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn actuator(&self) -> &Arc<dyn LockActuator> {
        &self.actuator
    }

    pub fn logger(&self) -> &Arc<AccessLogger> {
        &self.logger
    }

    /// Turns one pipeline result into a decision. No-face verdicts leave no trace.
    pub fn handle_verdict(
        &self,
        result: std::result::Result<Verdict, DetectorError>,
        frame: Option<&DynamicImage>,
    ) -> std::result::Result<Decision, StorageError> {
        self.set_state(EngineState::Evaluating);

        let verdict = match result {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!("Detection failed: {}", e);
                self.set_state(EngineState::Denying);
                let event = AccessEvent::denied(None, 0.0, EventSource::Recognition)
                    .with_error(e.to_string());
                return self.finish(self.logger.record(event, None).map(Decision::Denied));
            }
        };

        if verdict.is_no_face() {
            self.set_state(EngineState::Idle);
            return Ok(Decision::NoFace);
        }

        // NaN cannot be stored; keep the label, drop the score.
        let (confidence, fault) = if verdict.confidence.is_finite() {
            (verdict.confidence, None)
        } else {
            tracing::warn!(label = ?verdict.label, "Recognizer returned a non-finite confidence");
            (0.0, Some(NON_FINITE_CONFIDENCE))
        };

        let admit = fault.is_none() && verdict.label.is_some() && self.policy.admits(confidence);
        let (image, encode_failed) = match frame {
            Some(frame) => match annotate_capture(frame, verdict.face.as_ref(), admit) {
                Ok(bytes) => (Some(bytes), false),
                Err(e) => {
                    tracing::warn!("Failed to encode access image: {}", e);
                    (None, true)
                }
            },
            None => (None, false),
        };

        let decided = if admit {
            self.denials().reset();
            self.admit(verdict.label, confidence, EventSource::Recognition, image, encode_failed)
        } else {
            self.set_state(EngineState::Denying);
            tracing::info!(
                label = ?verdict.label,
                confidence,
                threshold = self.policy.threshold,
                "Access denied"
            );
            let mut event = AccessEvent::denied(verdict.label, confidence, EventSource::Recognition);
            event.error = fault.map(str::to_string);
            event.image_persist_failed = encode_failed;
            let recorded = self.logger.record(event, image.as_deref()).map(Decision::Denied);

            let alert = self.denials().record_denial(verdict.label);
            if let Some(alert) = alert {
                self.notifier.notify(&alert);
            }
            recorded
        };
        self.finish(decided)
    }

    /// Out-of-band unlock: skips recognition, logged as an admission without a label.
    pub fn remote_unlock(&self) -> std::result::Result<Decision, StorageError> {
        tracing::info!("Remote unlock requested");
        let decided = self.admit(None, 0.0, EventSource::Remote, None, false);
        if matches!(decided, Ok(Decision::Admitted(_))) {
            self.denials().reset();
        }
        self.finish(decided)
    }

    /// Out-of-band lock. Not an access decision, so nothing is recorded.
    pub fn remote_lock(&self) -> std::result::Result<(), crate::common::ActuatorError> {
        tracing::info!("Remote lock requested");
        self.actuator.lock()
    }

    /// Recognition loop. Returns after `shutdown` is raised, once the current
    /// frame is finished, or when the camera keeps failing. The lock is forced
    /// shut either way.
    pub fn run(
        &self,
        camera: &mut dyn FrameSource,
        pipeline: &mut RecognitionPipeline,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        tracing::info!("Recognition loop started");
        let mut camera_failures = 0u32;

        let outcome = loop {
            if shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }

            let frame = match camera.next_frame() {
                Ok(frame) => {
                    camera_failures = 0;
                    frame
                }
                Err(e) => {
                    camera_failures += 1;
                    tracing::warn!("Frame capture failed ({}/{}): {}", camera_failures, MAX_CAMERA_FAILURES, e);
                    if camera_failures >= MAX_CAMERA_FAILURES {
                        break Err(FaceLockError::Camera(format!(
                            "giving up after {} consecutive capture failures: {}",
                            camera_failures, e
                        )));
                    }
                    std::thread::sleep(CAMERA_RETRY);
                    continue;
                }
            };

            let Some(result) = pipeline.evaluate(&frame) else {
                continue;
            };
            if let Err(e) = self.handle_verdict(result, Some(&frame)) {
                tracing::error!("Access decision could not be recorded: {}", e);
            }
        };

        if let Err(e) = self.actuator.lock() {
            tracing::error!("Failed to engage lock on loop exit: {}", e);
        }
        tracing::info!("Recognition loop stopped after {} frames", pipeline.frames_seen());
        outcome
    }

    fn admit(
        &self,
        label: Option<i64>,
        confidence: f32,
        source: EventSource,
        image: Option<Vec<u8>>,
        encode_failed: bool,
    ) -> std::result::Result<Decision, StorageError> {
        self.set_state(EngineState::Admitting);

        match self.actuator.unlock() {
            Ok(pulse) => {
                tracing::info!(label = ?label, confidence, %source, extended = pulse.extended, "Access granted");
                let mut event = AccessEvent::admitted(label, confidence, source);
                event.image_persist_failed = encode_failed;
                self.logger.record(event, image.as_deref()).map(Decision::Admitted)
            }
            Err(e) => {
                tracing::error!("Unlock failed, recording denial: {}", e);
                self.set_state(EngineState::Denying);
                let mut event = AccessEvent::denied(label, confidence, source).with_error(e.to_string());
                event.image_persist_failed = encode_failed;
                self.logger.record(event, image.as_deref()).map(Decision::Denied)
            }
        }
    }

    /// Held only for the tracker update, never across actuation, storage or alerts.
    fn denials(&self) -> MutexGuard<'_, DenialTracker> {
        self.denials.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: EngineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn finish<T>(&self, result: T) -> T {
        self.set_state(EngineState::Idle);
        result
    }
}

/// JPEG of the frame with the evaluated face outlined, green when admitted.
pub fn annotate_capture(
    frame: &DynamicImage,
    face: Option<&FaceBox>,
    admitted: bool,
) -> std::result::Result<Vec<u8>, image::ImageError> {
    let mut img = frame.to_rgb8();

    if let Some(face) = face {
        let color = if admitted { Rgb([0u8, 255, 0]) } else { Rgb([255u8, 0, 0]) };
        let x1 = face.x1.max(0.0) as i32;
        let y1 = face.y1.max(0.0) as i32;
        let x2 = face.x2.min(img.width() as f32) as i32;
        let y2 = face.y2.min(img.height() as f32) as i32;
        let width = (x2 - x1).max(1) as u32;
        let height = (y2 - y1).max(1) as u32;

        draw_hollow_rect_mut(&mut img, Rect::at(x1, y1).of_size(width, height), color);
        if width > 2 && height > 2 {
            draw_hollow_rect_mut(
                &mut img,
                Rect::at(x1 + 1, y1 + 1).of_size(width - 2, height - 2),
                color,
            );
        }
    }

    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Jpeg(JPEG_QUALITY))?;
    Ok(bytes)
}
