use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::common::dev_mode::DevMode;
use crate::common::error::{FaceLockError, Result, StartupFailure};
use crate::common::paths::{resolve_config_file, system_run_dir, DEV_CONFIG_FILE};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
}

fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_warmup_frames() -> u32 { 5 }
fn default_warmup_delay() -> u64 { 50 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_width(),
            height: default_height(),
            warmup_frames: default_warmup_frames(),
            warmup_delay_ms: default_warmup_delay(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    #[serde(default = "default_recognizer_path")]
    pub recognizer_path: PathBuf,
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_detector_path() -> PathBuf { PathBuf::from("models/face_detector.onnx") }
fn default_recognizer_path() -> PathBuf { PathBuf::from("models/face_embedding.onnx") }
fn default_optimization_level() -> u32 { 3 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            recognizer_path: default_recognizer_path(),
            optimization_level: default_optimization_level(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            detection_confidence: default_detection_confidence(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_normalization_value")]
    pub normalization_value: f32,
}

fn default_input_size() -> u32 { 112 }
fn default_normalization_value() -> f32 { 127.5 }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            normalization_value: default_normalization_value(),
        }
    }
}

/// Which side of the threshold counts as a match.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Distance-style scores: smaller is a closer match.
    LowerIsBetter,
    /// Similarity-style scores: larger is a closer match.
    HigherIsBetter,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognitionConfig {
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_comparison")]
    pub comparison: Comparison,
}

fn default_frame_skip() -> u32 { 5 }
fn default_confidence_threshold() -> f32 { 35.0 }
fn default_comparison() -> Comparison { Comparison::LowerIsBetter }

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            frame_skip: default_frame_skip(),
            confidence_threshold: default_confidence_threshold(),
            comparison: default_comparison(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockConfig {
    #[serde(default = "default_gpio_pin")]
    pub gpio_pin: u32,
    #[serde(default = "default_unlock_duration")]
    pub unlock_duration_ms: u64,
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,
}

fn default_gpio_pin() -> u32 { 7 }
fn default_unlock_duration() -> u64 { 2000 }
fn default_gpio_root() -> PathBuf { PathBuf::from("/sys/class/gpio") }

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            gpio_pin: default_gpio_pin(),
            unlock_duration_ms: default_unlock_duration(),
            gpio_root: default_gpio_root(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_access_images_dir")]
    pub access_images_dir: PathBuf,
    #[serde(default = "default_user_images_dir")]
    pub user_images_dir: PathBuf,
    #[serde(default = "default_access_log_file")]
    pub access_log_file: PathBuf,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_reader_connections")]
    pub reader_connections: usize,
}

fn default_database_path() -> PathBuf { PathBuf::from("smartlock.db") }
fn default_access_images_dir() -> PathBuf { PathBuf::from("access_images") }
fn default_user_images_dir() -> PathBuf { PathBuf::from("user_images") }
fn default_access_log_file() -> PathBuf { PathBuf::from("access_log.txt") }
fn default_busy_timeout() -> u64 { 2000 }
fn default_reader_connections() -> usize { 2 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            access_images_dir: default_access_images_dir(),
            user_images_dir: default_user_images_dir(),
            access_log_file: default_access_log_file(),
            busy_timeout_ms: default_busy_timeout(),
            reader_connections: default_reader_connections(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_socket")]
    pub socket_path: PathBuf,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default = "default_max_skew")]
    pub max_clock_skew_secs: u64,
}

fn default_remote_socket() -> PathBuf { system_run_dir().join("remote.sock") }
fn default_topic() -> String { "smartlock/control".to_string() }
fn default_max_skew() -> u64 { 30 }

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            socket_path: default_remote_socket(),
            topic: default_topic(),
            shared_secret: None,
            max_clock_skew_secs: default_max_skew(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default = "default_admin_socket")]
    pub socket_path: PathBuf,
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,
}

fn default_admin_socket() -> PathBuf { system_run_dir().join("admin.sock") }
fn default_max_upload() -> usize { 8 * 1024 * 1024 }

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            socket_path: default_admin_socket(),
            max_upload_bytes: default_max_upload(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AlertConfig {
    #[serde(default = "default_consecutive_denials")]
    pub consecutive_denials: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

fn default_consecutive_denials() -> u32 { 3 }
fn default_window_seconds() -> u64 { 60 }

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            consecutive_denials: default_consecutive_denials(),
            window_seconds: default_window_seconds(),
        }
    }
}

impl Config {
    /// Loads the in-tree development config.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Path::new(DEV_CONFIG_FILE))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StartupFailure::Config(format!(
                "config file not found: {}", path.display()
            )).into());
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Config for a binary run: the resolved file if it exists, defaults
    /// otherwise, with dev-mode paths applied last.
    pub fn for_run(explicit: Option<&Path>, dev_mode: &DevMode) -> Result<Self> {
        let path = resolve_config_file(explicit, dev_mode.is_enabled());
        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else if explicit.is_some() {
            return Err(StartupFailure::Config(format!(
                "config file not found: {}", path.display()
            )).into());
        } else {
            tracing::warn!("No config at {}, using defaults", path.display());
            Self::default()
        };

        dev_mode.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| StartupFailure::Config(format!("parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> FaceLockError { StartupFailure::Config(msg).into() };

        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(invalid(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(invalid(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(invalid("Detector input dimensions must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.detector.detection_confidence) {
            return Err(invalid(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.detection_confidence
            )));
        }
        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(invalid(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }

        if self.recognition.frame_skip == 0 {
            return Err(invalid("frame_skip must be at least 1".into()));
        }
        if !self.recognition.confidence_threshold.is_finite() {
            return Err(invalid(format!(
                "confidence_threshold must be finite, got {}",
                self.recognition.confidence_threshold
            )));
        }

        if self.lock.unlock_duration_ms == 0 {
            return Err(invalid("unlock_duration_ms must be non-zero".into()));
        }

        if self.storage.reader_connections == 0 {
            return Err(invalid("reader_connections must be at least 1".into()));
        }

        if self.remote.topic.trim().is_empty() {
            return Err(invalid("remote topic must not be empty".into()));
        }
        if matches!(self.remote.shared_secret.as_deref(), Some("")) {
            return Err(invalid("remote shared_secret must not be empty when set".into()));
        }

        if self.admin.max_upload_bytes == 0 {
            return Err(invalid("max_upload_bytes must be non-zero".into()));
        }

        Ok(())
    }
}
