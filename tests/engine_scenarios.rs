mod common;

use common::*;
use face_lock::common::DetectorError;
use face_lock::core::{Alert, Decision, Notifier, Verdict};
use face_lock::hardware::{LockActuator, LockState};
use face_lock::storage::{EventFilter, EventSource, Outcome};
use image::DynamicImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn verdict(label: i64, confidence: f32) -> Verdict {
    Verdict {
        label: Some(label),
        confidence,
        face: Some(face_box()),
    }
}

#[test]
fn known_face_under_threshold_unlocks_and_is_logged() {
    let dir = tempdir().unwrap();
    let h = harness(
        dir.path(),
        test_config(dir.path()),
        Arc::new(ScriptedDetector::one_face()),
        Arc::new(ScriptedRecognizer::always(Some(3), 30.0)),
    );
    let frame = DynamicImage::new_rgb8(64, 48);

    let decision = h.context.engine.handle_verdict(Ok(verdict(3, 30.0)), Some(&frame)).unwrap();

    assert!(decision.is_admitted());
    assert_eq!(h.actuator.unlocks(), 1);
    assert_eq!(h.actuator.state(), LockState::UnlockedTimed);

    let events = h.context.store.list_access_events(&EventFilter::default()).unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.outcome, Outcome::Admitted);
    assert_eq!(event.matched_label, Some(3));
    assert_eq!(event.confidence, 30.0);
    assert_eq!(event.source, EventSource::Recognition);

    let image = event.captured_image_path.as_ref().expect("admission keeps the frame");
    assert!(image.exists());
    assert!(image.starts_with(dir.path().join("access_images")));

    let text = std::fs::read_to_string(dir.path().join("access_log.txt")).unwrap();
    assert!(text.contains("admitted"));
    assert!(text.contains("label=3"));
}

#[test]
fn known_face_over_threshold_is_denied_without_actuation() {
    let dir = tempdir().unwrap();
    let h = harness(
        dir.path(),
        test_config(dir.path()),
        Arc::new(ScriptedDetector::one_face()),
        Arc::new(ScriptedRecognizer::always(Some(3), 60.0)),
    );
    let frame = DynamicImage::new_rgb8(64, 48);

    let decision = h.context.engine.handle_verdict(Ok(verdict(3, 60.0)), Some(&frame)).unwrap();

    assert!(matches!(decision, Decision::Denied(_)));
    assert_eq!(h.actuator.unlocks(), 0);
    assert!(h.actuator.pin.transitions().is_empty());

    let events = h.context.store.list_access_events(&EventFilter::default()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, Outcome::Denied);
    assert_eq!(events[0].matched_label, Some(3));
    assert!(events[0].captured_image_path.as_ref().unwrap().exists());
}

#[test]
fn threshold_itself_is_not_good_enough() {
    let dir = tempdir().unwrap();
    let h = harness(
        dir.path(),
        test_config(dir.path()),
        Arc::new(ScriptedDetector::one_face()),
        Arc::new(ScriptedRecognizer::always(Some(3), 40.0)),
    );

    let decision = h.context.engine.handle_verdict(Ok(verdict(3, 40.0)), None).unwrap();
    assert!(!decision.is_admitted());
    assert_eq!(h.actuator.unlocks(), 0);
}

#[test]
fn no_face_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let h = harness(
        dir.path(),
        test_config(dir.path()),
        Arc::new(ScriptedDetector::always(Vec::new())),
        Arc::new(ScriptedRecognizer::always(None, 0.0)),
    );
    let frame = DynamicImage::new_rgb8(64, 48);

    let decision = h.context.engine.handle_verdict(Ok(Verdict::no_face()), Some(&frame)).unwrap();

    assert!(matches!(decision, Decision::NoFace));
    assert!(decision.event().is_none());
    assert_eq!(h.context.store.count_access_events().unwrap(), 0);
    assert!(files_in(&dir.path().join("access_images")).is_empty());
    assert_eq!(h.actuator.unlocks(), 0);
}

#[test]
fn every_admission_matches_exactly_one_unlock() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.lock.unlock_duration_ms = 150;
    let h = harness(
        dir.path(),
        config,
        Arc::new(ScriptedDetector::one_face()),
        Arc::new(ScriptedRecognizer::always(Some(1), 10.0)),
    );

    let script = [(1, 10.0), (1, 80.0), (2, 5.0), (2, 5.0), (1, 41.0), (4, 39.9)];
    for (label, confidence) in script {
        h.context.engine.handle_verdict(Ok(verdict(label, confidence)), None).unwrap();
    }

    let admitted = h
        .context
        .store
        .list_access_events(&EventFilter {
            outcome: Some(Outcome::Admitted),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(admitted.len(), 4);
    assert_eq!(h.actuator.unlocks(), 4);
    assert_eq!(h.context.store.count_access_events().unwrap(), 6);
}

#[test]
fn unrecognized_face_is_denied_even_with_a_good_score() {
    let dir = tempdir().unwrap();
    let h = harness(
        dir.path(),
        test_config(dir.path()),
        Arc::new(ScriptedDetector::one_face()),
        Arc::new(ScriptedRecognizer::always(None, 1.0)),
    );
    let unknown = Verdict {
        label: None,
        confidence: 1.0,
        face: Some(face_box()),
    };

    let decision = h.context.engine.handle_verdict(Ok(unknown), None).unwrap();
    assert!(!decision.is_admitted());
    assert_eq!(decision.event().unwrap().matched_label, None);
    assert_eq!(h.actuator.unlocks(), 0);
}

#[test]
fn remote_unlock_is_logged_without_a_label() {
    let dir = tempdir().unwrap();
    let h = harness(
        dir.path(),
        test_config(dir.path()),
        Arc::new(ScriptedDetector::one_face()),
        Arc::new(ScriptedRecognizer::always(None, 0.0)),
    );

    let decision = h.context.engine.remote_unlock().unwrap();
    assert!(decision.is_admitted());
    assert_eq!(h.actuator.unlocks(), 1);

    let events = h
        .context
        .store
        .list_access_events(&EventFilter {
            source: Some(EventSource::Remote),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].matched_label, None);
    assert_eq!(events[0].outcome, Outcome::Admitted);
    assert!(events[0].captured_image_path.is_none());
}

#[test]
fn remote_lock_cuts_the_unlock_window_short() {
    let dir = tempdir().unwrap();
    let h = harness(
        dir.path(),
        test_config(dir.path()),
        Arc::new(ScriptedDetector::one_face()),
        Arc::new(ScriptedRecognizer::always(None, 0.0)),
    );

    h.context.engine.handle_verdict(Ok(verdict(3, 30.0)), None).unwrap();
    thread::sleep(Duration::from_millis(500));
    h.context.engine.remote_lock().unwrap();
    assert_eq!(h.actuator.state(), LockState::Locked);

    // the 2 s window would have ended here
    thread::sleep(Duration::from_millis(1700));
    assert_eq!(h.actuator.inner.relock_count(), 0);
    assert_eq!(h.actuator.pin.transitions(), vec![true, false]);

    // lock commands are not access decisions
    assert_eq!(h.context.store.count_access_events().unwrap(), 1);
}

#[test]
fn run_loop_samples_every_nth_frame_and_locks_on_exit() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.recognition.frame_skip = 5;
    let detector = Arc::new(ScriptedDetector::one_face());
    let h = harness(
        dir.path(),
        config,
        detector.clone(),
        Arc::new(ScriptedRecognizer::always(Some(2), 12.0)),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut camera = FakeFrames::new(10, shutdown.clone());
    let mut pipeline = h.context.pipeline();

    h.context.engine.run(&mut camera, &mut pipeline, &shutdown).unwrap();

    assert_eq!(pipeline.frames_seen(), 10);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.context.store.count_access_events().unwrap(), 2);
    assert_eq!(h.actuator.unlocks(), 2);
    assert_eq!(h.actuator.state(), LockState::Locked);
    assert!(h.actuator.locks() >= 1);
}

#[test]
fn run_loop_survives_detector_errors_and_camera_hiccups() {
    let dir = tempdir().unwrap();
    let detector = Arc::new(ScriptedDetector::script(vec![
        Err(DetectorError::Inference("tensor shape mismatch".into())),
        Ok(vec![face_box()]),
        Ok(Vec::new()),
    ]));
    let h = harness(
        dir.path(),
        test_config(dir.path()),
        detector.clone(),
        Arc::new(ScriptedRecognizer::always(Some(5), 20.0)),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut camera = FakeFrames::new(3, shutdown.clone()).failing_first(2);
    let mut pipeline = h.context.pipeline();

    h.context.engine.run(&mut camera, &mut pipeline, &shutdown).unwrap();

    assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
    let events = h.context.store.list_access_events(&EventFilter::default()).unwrap();
    assert_eq!(events.len(), 2);

    // newest first
    assert_eq!(events[0].outcome, Outcome::Admitted);
    assert_eq!(events[0].matched_label, Some(5));
    assert_eq!(events[1].outcome, Outcome::Denied);
    assert_eq!(events[1].matched_label, None);
    assert_eq!(events[1].confidence, 0.0);
    assert!(events[1].error.as_deref().unwrap().contains("tensor shape mismatch"));
    assert!(events[1].captured_image_path.is_none());
}

#[derive(Default)]
struct CollectingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl Notifier for CollectingNotifier {
    fn notify(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

#[test]
fn repeated_denials_raise_one_alert_per_burst() {
    let dir = tempdir().unwrap();
    let notifier = Arc::new(CollectingNotifier::default());
    let actuator = Arc::new(CountingActuator::new(Duration::from_millis(2000)));
    let h = harness_with_notifier(
        dir.path(),
        test_config(dir.path()),
        Arc::new(ScriptedDetector::one_face()),
        Arc::new(ScriptedRecognizer::always(None, 0.0)),
        actuator,
        notifier.clone(),
    );
    let engine = &h.context.engine;

    engine.handle_verdict(Ok(verdict(8, 90.0)), None).unwrap();
    engine.handle_verdict(Ok(verdict(8, 90.0)), None).unwrap();
    assert!(notifier.alerts.lock().unwrap().is_empty());

    engine.handle_verdict(Ok(verdict(9, 95.0)), None).unwrap();
    {
        let alerts = notifier.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].denials, 3);
        assert_eq!(alerts[0].last_label, Some(9));
    }

    // an admission in between starts the count over
    engine.handle_verdict(Ok(verdict(8, 90.0)), None).unwrap();
    engine.handle_verdict(Ok(verdict(8, 90.0)), None).unwrap();
    engine.handle_verdict(Ok(verdict(1, 10.0)), None).unwrap();
    engine.handle_verdict(Ok(verdict(8, 90.0)), None).unwrap();
    assert_eq!(notifier.alerts.lock().unwrap().len(), 1);

    // detector failures are not attempts
    for _ in 0..3 {
        engine
            .handle_verdict(Err(DetectorError::Unavailable("model missing".into())), None)
            .unwrap();
    }
    assert_eq!(notifier.alerts.lock().unwrap().len(), 1);
}

struct SlowNotifier {
    started: Mutex<std::sync::mpsc::Sender<()>>,
    delay: Duration,
}

impl Notifier for SlowNotifier {
    fn notify(&self, _alert: &Alert) {
        let _ = self.started.lock().unwrap().send(());
        thread::sleep(self.delay);
    }
}

#[test]
fn remote_commands_do_not_wait_behind_a_slow_alert() {
    let dir = tempdir().unwrap();
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let notifier = Arc::new(SlowNotifier {
        started: Mutex::new(started_tx),
        delay: Duration::from_millis(1500),
    });
    let actuator = Arc::new(CountingActuator::new(Duration::from_millis(2000)));
    let h = harness_with_notifier(
        dir.path(),
        test_config(dir.path()),
        Arc::new(ScriptedDetector::one_face()),
        Arc::new(ScriptedRecognizer::always(None, 0.0)),
        actuator,
        notifier,
    );

    let engine = Arc::clone(&h.context.engine);
    let denier = thread::spawn(move || {
        for _ in 0..3 {
            engine.handle_verdict(Ok(verdict(8, 90.0)), None).unwrap();
        }
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let began = Instant::now();
    h.context.engine.remote_unlock().unwrap();
    h.context.engine.remote_lock().unwrap();
    let elapsed = began.elapsed();

    assert!(elapsed < Duration::from_millis(300), "remote commands took {:?}", elapsed);
    assert_eq!(h.actuator.state(), LockState::Locked);
    denier.join().unwrap();
    assert_eq!(h.context.store.count_access_events().unwrap(), 4);
}
