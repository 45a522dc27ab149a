pub mod app;
pub mod camera;
pub mod common;
pub mod core;
pub mod hardware;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use app::{AppContext, Components};
pub use common::{Config, DevMode, FaceLockError, Result};
pub use core::{AccessControlEngine, Decision, RecognitionPipeline, Verdict};
pub use hardware::{LockActuator, LockState, TimedLock};
pub use storage::{AccessEvent, AccessLogger, PersistentStore};
