pub mod alerts;
pub mod detector;
pub mod engine;
pub mod pipeline;
pub mod recognizer;

pub use alerts::{Alert, DenialTracker, Notifier, TracingNotifier};
pub use detector::{select_primary, FaceBox, FaceDetector, OnnxFaceDetector};
pub use engine::{annotate_capture, AccessControlEngine, Decision, EngineState};
pub use pipeline::{AdmissionPolicy, RecognitionPipeline};
pub use recognizer::{
    cosine_similarity, Embedding, EmbeddingRecognizer, FaceEmbedder, FaceRecognizer,
    GalleryEnroller, OnnxEmbedder, TemplateEnroller, TemplateGallery, Verdict,
};
