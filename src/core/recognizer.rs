use crate::common::{Config, DetectorError, StartupFailure};
use crate::common::config::{ModelConfig, RecognizerConfig};
use crate::core::detector::{optimization_level, select_primary, FaceBox, FaceDetector};
use crate::storage::User;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, Session, SessionBuilder, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

pub type Embedding = Vec<f32>;

/// Output of one recognition evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub label: Option<i64>,
    pub confidence: f32,
    /// The region the verdict was computed on; `None` means no face was found.
    pub face: Option<FaceBox>,
}

impl Verdict {
    pub fn no_face() -> Self {
        Self { label: None, confidence: 0.0, face: None }
    }

    pub fn is_no_face(&self) -> bool {
        self.face.is_none()
    }
}

/// Identifies the face inside `face`.
pub trait FaceRecognizer: Send + Sync {
    fn recognize(&self, frame: &DynamicImage, face: &FaceBox) -> Result<Verdict, DetectorError>;
}

/// Turns a face crop into a feature vector.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, frame: &DynamicImage, face: &FaceBox) -> Result<Embedding, DetectorError>;
}

/// Keeps recognizer templates in step with enrolled users.
pub trait TemplateEnroller: Send + Sync {
    fn refresh(&self, user: &User) -> Result<(), DetectorError>;
}

/// Reference embeddings keyed by user label.
#[derive(Debug, Default, Clone)]
pub struct TemplateGallery {
    templates: BTreeMap<i64, Embedding>,
}

impl TemplateGallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, label: i64, embedding: Embedding) {
        self.templates.insert(label, embedding);
    }

    pub fn remove(&mut self, label: i64) -> Option<Embedding> {
        self.templates.remove(&label)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Best cosine similarity over all templates. Ties keep the lower label.
    pub fn best_match(&self, embedding: &[f32]) -> Option<(i64, f32)> {
        let mut best: Option<(i64, f32)> = None;
        for (&label, template) in &self.templates {
            let similarity = cosine_similarity(embedding, template);
            match best {
                Some((_, current)) if similarity <= current => {}
                _ => best = Some((label, similarity)),
            }
        }
        best
    }
}

/// Recognizer that matches embeddings against a shared template gallery.
/// Confidence is cosine similarity, so higher is better.
pub struct EmbeddingRecognizer {
    embedder: Arc<dyn FaceEmbedder>,
    gallery: Arc<RwLock<TemplateGallery>>,
}

impl EmbeddingRecognizer {
    pub fn new(embedder: Arc<dyn FaceEmbedder>, gallery: Arc<RwLock<TemplateGallery>>) -> Self {
        Self { embedder, gallery }
    }
}

impl FaceRecognizer for EmbeddingRecognizer {
    fn recognize(&self, frame: &DynamicImage, face: &FaceBox) -> Result<Verdict, DetectorError> {
        let embedding = self.embedder.embed(frame, face)?;
        let gallery = self.gallery.read().unwrap_or_else(PoisonError::into_inner);

        let verdict = match gallery.best_match(&embedding) {
            Some((label, similarity)) => Verdict {
                label: Some(label),
                confidence: similarity,
                face: Some(face.clone()),
            },
            None => Verdict { label: None, confidence: 0.0, face: Some(face.clone()) },
        };
        Ok(verdict)
    }
}

/// Builds a user's template from their enrolled reference image.
pub struct GalleryEnroller {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    gallery: Arc<RwLock<TemplateGallery>>,
}

impl GalleryEnroller {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        gallery: Arc<RwLock<TemplateGallery>>,
    ) -> Self {
        Self { detector, embedder, gallery }
    }

    /// Loads templates for every user, skipping (and logging) the ones that fail.
    pub fn load_all(&self, users: &[User]) -> usize {
        let mut loaded = 0;
        for user in users {
            match self.refresh(user) {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!(
                    "No template for user {} ({}): {}", user.label, user.name, e
                ),
            }
        }
        tracing::info!("Loaded {}/{} user templates", loaded, users.len());
        loaded
    }
}

impl TemplateEnroller for GalleryEnroller {
    fn refresh(&self, user: &User) -> Result<(), DetectorError> {
        let image = image::open(&user.image_path).map_err(|e| {
            DetectorError::Unavailable(format!(
                "cannot read reference image {}: {}", user.image_path.display(), e
            ))
        })?;

        let faces = self.detector.detect(&image)?;
        let face = select_primary(&faces).ok_or_else(|| {
            DetectorError::Inference(format!(
                "no face in reference image {}", user.image_path.display()
            ))
        })?;
        let embedding = self.embedder.embed(&image, face)?;

        self.gallery
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .upsert(user.label, embedding);
        tracing::debug!("Template refreshed for user {}", user.label);
        Ok(())
    }
}

/// ArcFace-style single-channel embedding model on ONNX Runtime.
pub struct OnnxEmbedder {
    session: Session,
    _environment: Arc<Environment>,
    config: RecognizerConfig,
}

impl OnnxEmbedder {
    pub fn new(config: &Config) -> Result<Self, StartupFailure> {
        Self::with_model(&config.models, &config.recognizer)
    }

    fn with_model(models: &ModelConfig, recognizer: &RecognizerConfig) -> Result<Self, StartupFailure> {
        let model_path = &models.recognizer_path;
        if !model_path.exists() {
            return Err(StartupFailure::Model(format!(
                "Recognition model not found at: {:?}", model_path
            )));
        }

        let load = || -> Result<(Arc<Environment>, Session), ort::OrtError> {
            let environment = Arc::new(
                Environment::builder()
                    .with_name("face_recognizer")
                    .build()?,
            );
            let session = SessionBuilder::new(&environment)?
                .with_optimization_level(optimization_level(models.optimization_level))?
                .with_model_from_file(model_path)?;
            Ok((environment, session))
        };

        let (environment, session) = load()
            .map_err(|e| StartupFailure::Model(format!("Failed to load recognizer: {}", e)))?;

        tracing::info!("Loaded face embedding model from {}", model_path.display());
        Ok(Self {
            session,
            _environment: environment,
            config: recognizer.clone(),
        })
    }

    fn crop_face(image: &DynamicImage, face: &FaceBox) -> DynamicImage {
        let x = face.x1.max(0.0) as u32;
        let y = face.y1.max(0.0) as u32;
        let width = face.width().max(1.0) as u32;
        let height = face.height().max(1.0) as u32;

        image.crop_imm(x, y, width, height)
    }

    fn preprocess_face(&self, img: &DynamicImage) -> Array4<f32> {
        let gray = img.to_luma8();
        let size = self.config.input_size as usize;
        let norm_val = self.config.normalization_value;
        let mut array = Array4::<f32>::zeros((1, 1, size, size));

        for (x, y, pixel) in gray.enumerate_pixels() {
            array[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - norm_val) / norm_val;
        }

        array
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(&self, frame: &DynamicImage, face: &FaceBox) -> Result<Embedding, DetectorError> {
        let face_img = Self::crop_face(frame, face);
        let resized = face_img.resize_exact(
            self.config.input_size,
            self.config.input_size,
            FilterType::Triangle,
        );

        let input_array = self.preprocess_face(&resized);
        let cow_array = CowArray::from(input_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let first = outputs
            .first()
            .ok_or_else(|| DetectorError::Inference("embedding model produced no outputs".into()))?;
        let tensor = first.try_extract::<f32>()?;
        let embedding = tensor.view().iter().copied().collect();
        Ok(embedding)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
