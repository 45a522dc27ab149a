use crate::common::config::{Comparison, RecognitionConfig};
use crate::common::DetectorError;
use crate::core::detector::{select_primary, FaceDetector};
use crate::core::recognizer::{FaceRecognizer, Verdict};
use image::DynamicImage;
use std::sync::Arc;

/// Threshold plus the direction in which scores improve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionPolicy {
    pub threshold: f32,
    pub comparison: Comparison,
}

impl AdmissionPolicy {
    pub fn new(threshold: f32, comparison: Comparison) -> Self {
        Self { threshold, comparison }
    }

    pub fn from_config(config: &RecognitionConfig) -> Self {
        Self::new(config.confidence_threshold, config.comparison)
    }

    /// Strictly better than the threshold. NaN never admits.
    pub fn admits(&self, confidence: f32) -> bool {
        match self.comparison {
            Comparison::LowerIsBetter => confidence < self.threshold,
            Comparison::HigherIsBetter => confidence > self.threshold,
        }
    }
}

/// Frame sampling plus detection and recognition. Holds no persistent state.
pub struct RecognitionPipeline {
    detector: Arc<dyn FaceDetector>,
    recognizer: Arc<dyn FaceRecognizer>,
    frame_skip: u32,
    frames_seen: u64,
}

impl RecognitionPipeline {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        recognizer: Arc<dyn FaceRecognizer>,
        frame_skip: u32,
    ) -> Self {
        Self {
            detector,
            recognizer,
            frame_skip: frame_skip.max(1),
            frames_seen: 0,
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// `None` for frames skipped by the sampling policy; every Nth frame
    /// (the Nth, 2Nth, ...) is evaluated.
    pub fn evaluate(&mut self, frame: &DynamicImage) -> Option<Result<Verdict, DetectorError>> {
        self.frames_seen += 1;
        if self.frames_seen % self.frame_skip as u64 != 0 {
            return None;
        }
        Some(self.evaluate_now(frame))
    }

    /// Runs detection and recognition regardless of sampling.
    pub fn evaluate_now(&self, frame: &DynamicImage) -> Result<Verdict, DetectorError> {
        let faces = self.detector.detect(frame)?;
        let Some(face) = select_primary(&faces) else {
            return Ok(Verdict::no_face());
        };

        if faces.len() > 1 {
            tracing::debug!("{} faces detected, evaluating the largest", faces.len());
        }

        let mut verdict = self.recognizer.recognize(frame, face)?;
        if verdict.face.is_none() {
            verdict.face = Some(face.clone());
        }
        Ok(verdict)
    }
}
