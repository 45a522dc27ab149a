use crate::common::{Config, DetectorError, StartupFailure};
use crate::common::config::{DetectorConfig, ModelConfig};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

/// Locates faces in a frame.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &DynamicImage) -> Result<Vec<FaceBox>, DetectorError>;
}

/// The one region a frame is judged on: largest box, then highest detector
/// confidence, then earliest in detector order.
pub fn select_primary(faces: &[FaceBox]) -> Option<&FaceBox> {
    let mut best: Option<&FaceBox> = None;
    for face in faces {
        best = match best {
            None => Some(face),
            Some(current) => {
                let by_area = face.area().total_cmp(&current.area());
                let by_confidence = face.confidence.total_cmp(&current.confidence);
                if by_area.then(by_confidence).is_gt() {
                    Some(face)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

/// YOLO-style single-class face detector running on ONNX Runtime.
pub struct OnnxFaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    config: DetectorConfig,
}

impl OnnxFaceDetector {
    pub fn new(config: &Config) -> Result<Self, StartupFailure> {
        Self::with_model(&config.models, &config.detector, None)
    }

    pub fn new_with_model_path(config: &Config, models_base: &Path) -> Result<Self, StartupFailure> {
        Self::with_model(&config.models, &config.detector, Some(models_base))
    }

    fn with_model(
        models: &ModelConfig,
        detector: &DetectorConfig,
        models_base: Option<&Path>,
    ) -> Result<Self, StartupFailure> {
        let mut model_path = models.detector_path.clone();
        if let Some(base) = models_base {
            if model_path.is_relative() {
                model_path = base.join(&model_path);
            }
        }

        if !model_path.exists() {
            return Err(StartupFailure::Model(format!(
                "Detector model not found at: {:?}", model_path
            )));
        }

        let load = || -> Result<(Arc<Environment>, Session), ort::OrtError> {
            let environment = Arc::new(
                Environment::builder()
                    .with_name("face_detector")
                    .build()?,
            );
            let session = SessionBuilder::new(&environment)?
                .with_optimization_level(optimization_level(models.optimization_level))?
                .with_model_from_file(&model_path)?;
            Ok((environment, session))
        };

        let (environment, session) = load()
            .map_err(|e| StartupFailure::Model(format!("Failed to load detector: {}", e)))?;

        tracing::info!("Loaded face detector from {}", model_path.display());
        Ok(Self {
            session,
            _environment: environment,
            config: detector.clone(),
        })
    }

    fn image_to_array(&self, img: &DynamicImage) -> Array4<f32> {
        let gray = img.to_luma8();
        let width = img.width() as usize;
        let height = img.height() as usize;
        let mut array = Array4::<f32>::zeros((1, 3, height, width));

        let norm_factor = 1.0 / 255.0;
        for (x, y, pixel) in gray.enumerate_pixels() {
            let value = pixel[0] as f32 * norm_factor;
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = value;
            array[[0, 1, y, x]] = value;
            array[[0, 2, y, x]] = value;
        }

        array
    }

    fn parse_detections(&self, outputs: &[Value]) -> Result<Vec<FaceBox>, DetectorError> {
        let Some(first) = outputs.first() else {
            return Err(DetectorError::Inference("detector produced no outputs".into()));
        };

        let tensor = first.try_extract::<f32>()?;
        let output = tensor.view().to_owned();
        let shape = output.shape().to_vec();
        let data = output
            .as_slice()
            .ok_or_else(|| DetectorError::Inference("non-contiguous detector output".into()))?;

        // [1, N, 5] or transposed [1, 5, N], each row [cx, cy, w, h, score]
        let (num_predictions, prediction_length, is_transposed) = match shape.len() {
            3 if shape[2] > shape[1] && shape[1] <= 10 => (shape[2], shape[1], true),
            3 => (shape[1], shape[2], false),
            2 => (shape[0], shape[1], false),
            _ => {
                return Err(DetectorError::Inference(format!(
                    "unexpected detector output shape: {:?}", shape
                )))
            }
        };
        if prediction_length < 4 {
            return Err(DetectorError::Inference(format!(
                "detector rows too short: {:?}", shape
            )));
        }

        let input_w = self.config.input_width as f32;
        let input_h = self.config.input_height as f32;
        let mut faces = Vec::new();

        for i in 0..num_predictions {
            let at = |field: usize| -> f32 {
                if field >= prediction_length {
                    return 0.0;
                }
                if is_transposed {
                    data[field * num_predictions + i]
                } else {
                    data[i * prediction_length + field]
                }
            };
            if let Some(face) = decode_box([at(0), at(1), at(2), at(3)], at(4), input_w, input_h) {
                faces.push(face);
            }
        }

        let mut faces = apply_nms(faces, 0.45);
        faces.retain(|face| face.confidence >= self.config.detection_confidence);
        faces.truncate(5);
        Ok(faces)
    }
}

/// One `[cx, cy, w, h]` row in model-input pixels, or `None` for noise.
/// Rows with every value in `0..=1` are normalized and scaled per axis.
fn decode_box(row: [f32; 4], confidence: f32, input_w: f32, input_h: f32) -> Option<FaceBox> {
    if confidence <= 0.001 {
        return None;
    }

    let [cx, cy, w, h] = row;
    let normalized = row.iter().all(|v| *v <= 1.0);
    let (sx, sy) = if normalized { (input_w, input_h) } else { (1.0, 1.0) };
    let (cx, cy, w, h) = (cx * sx, cy * sy, w * sx, h * sy);

    let x1 = (cx - w / 2.0).max(0.0);
    let y1 = (cy - h / 2.0).max(0.0);
    let x2 = (cx + w / 2.0).min(input_w);
    let y2 = (cy + h / 2.0).min(input_h);

    (x2 > x1 && y2 > y1 && (x2 - x1) > 10.0 && (y2 - y1) > 10.0)
        .then_some(FaceBox { x1, y1, x2, y2, confidence })
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&self, frame: &DynamicImage) -> Result<Vec<FaceBox>, DetectorError> {
        let orig_width = frame.width() as f32;
        let orig_height = frame.height() as f32;

        let img_array = if frame.width() == self.config.input_width
            && frame.height() == self.config.input_height
        {
            self.image_to_array(frame)
        } else {
            let resized = frame.resize_exact(
                self.config.input_width,
                self.config.input_height,
                FilterType::Nearest,
            );
            self.image_to_array(&resized)
        };

        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut faces = self.parse_detections(&outputs)?;

        let scale_x = orig_width / self.config.input_width as f32;
        let scale_y = orig_height / self.config.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }
}

pub(crate) fn optimization_level(level: u32) -> GraphOptimizationLevel {
    match level {
        0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

/// Greedy non-maximum suppression, highest confidence first.
pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| calculate_iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

pub fn calculate_iou(box1: &FaceBox, box2: &FaceBox) -> f32 {
    let x1 = box1.x1.max(box2.x1);
    let y1 = box1.y1.max(box2.y1);
    let x2 = box1.x2.min(box2.x2);
    let y2 = box1.y2.min(box2.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = box1.area() + box2.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
