pub mod config;
pub mod dev_mode;
pub mod error;
pub mod paths;

pub use config::{Comparison, Config};
pub use dev_mode::DevMode;
pub use error::{
    ActuatorError, DetectorError, FaceLockError, MalformedInput, Result, StartupFailure,
    StorageError,
};
pub use paths::{
    resolve_config_file, system_config_file, system_models_dir, system_run_dir,
    user_config_file,
};
