use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceLockError {
    #[error("Startup failure: {0}")]
    Startup(#[from] StartupFailure),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Malformed input: {0}")]
    Malformed(#[from] MalformedInput),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl FaceLockError {
    /// Process exit code for errors that end the service.
    pub fn exit_code(&self) -> u8 {
        match self {
            FaceLockError::Startup(failure) => failure.exit_code(),
            _ => 1,
        }
    }
}

/// Anything that prevents the recognition loop from starting.
#[derive(Error, Debug)]
pub enum StartupFailure {
    #[error("camera unavailable: {0}")]
    Camera(String),

    #[error("GPIO initialization failed: {0}")]
    Gpio(String),

    #[error("store could not be opened: {0}")]
    Store(String),

    #[error("model could not be loaded: {0}")]
    Model(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StartupFailure {
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupFailure::Camera(_) => 2,
            StartupFailure::Gpio(_) => 3,
            StartupFailure::Store(_) => 4,
            StartupFailure::Model(_) => 5,
            StartupFailure::Config(_) => 6,
        }
    }
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum ActuatorError {
    #[error("GPIO pin {pin} write failed: {source}")]
    Gpio {
        pin: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("actuator has been shut down")]
    ShutDown,
}

/// Client-supplied input that was refused without touching any state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedInput {
    #[error("invalid filename '{0}': expected <label>_<name>.<ext>")]
    FilenameFormat(String),

    #[error("invalid label '{0}': must be a non-negative integer")]
    InvalidLabel(String),

    #[error("unsupported image extension '{0}'")]
    UnsupportedExtension(String),

    #[error("upload is empty")]
    EmptyUpload,

    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("upload content is not a recognized image")]
    NotAnImage,

    #[error("unrecognized remote command '{0}'")]
    UnknownCommand(String),

    #[error("message on topic '{got}' but expected '{expected}'")]
    WrongTopic { expected: String, got: String },

    #[error("missing or invalid command signature")]
    BadSignature,

    #[error("command issued at {issued_at} is outside the accepted window")]
    StaleCommand { issued_at: i64 },
}

pub type Result<T> = std::result::Result<T, FaceLockError>;
