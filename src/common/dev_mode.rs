use std::path::{Path, PathBuf};
use std::fs;
use crate::common::config::Config;
use crate::common::error::Result;
use crate::common::paths::{DEV_ADMIN_SOCKET, DEV_REMOTE_SOCKET};

#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        Self::with_base_dir(enabled, PathBuf::from("./dev_data"))
    }

    pub fn with_base_dir(enabled: bool, base_dir: PathBuf) -> Result<Self> {
        if enabled {
            fs::create_dir_all(&base_dir)?;
            fs::create_dir_all(base_dir.join("user_images"))?;
            fs::create_dir_all(base_dir.join("access_images"))?;
            fs::create_dir_all(base_dir.join("captures"))?;

            tracing::info!("Development mode enabled - data will be saved to: {}",
                           base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Re-roots every storage path and socket so a dev run never touches system locations.
    pub fn apply(&self, config: &mut Config) {
        if !self.enabled {
            return;
        }

        let storage = &mut config.storage;
        storage.database_path = self.base_dir.join("smartlock.db");
        storage.access_images_dir = self.base_dir.join("access_images");
        storage.user_images_dir = self.base_dir.join("user_images");
        storage.access_log_file = self.base_dir.join("access_log.txt");

        config.admin.socket_path = PathBuf::from(DEV_ADMIN_SOCKET);
        config.remote.socket_path = PathBuf::from(DEV_REMOTE_SOCKET);
    }

    pub fn captures_dir(&self) -> PathBuf {
        if self.enabled {
            self.base_dir.join("captures")
        } else {
            PathBuf::from(".")
        }
    }

    pub fn get_capture_path(&self, prefix: &str) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        self.captures_dir().join(format!("{}_{}.jpg", prefix, timestamp))
    }
}
