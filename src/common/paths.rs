use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "face-lock.toml";
pub const DEV_CONFIG_FILE: &str = "configs/face-lock.toml";

pub const DEV_ADMIN_SOCKET: &str = "/tmp/facelock-admin.sock";
pub const DEV_REMOTE_SOCKET: &str = "/tmp/facelock-remote.sock";

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/facelock").join(CONFIG_FILE_NAME)
}

pub fn system_models_dir() -> PathBuf {
    PathBuf::from("/usr/share/facelock/models")
}

pub fn system_run_dir() -> PathBuf {
    PathBuf::from("/run/facelock")
}

/// Per-user config location, e.g. `~/.config/facelock/face-lock.toml`.
pub fn user_config_file() -> Option<PathBuf> {
    ProjectDirs::from("", "", "facelock").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Picks the config file to load: an explicit path wins, dev mode uses the
/// in-tree file, otherwise the user file if present, then the system file.
pub fn resolve_config_file(explicit: Option<&Path>, dev: bool) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if dev {
        return PathBuf::from(DEV_CONFIG_FILE);
    }
    match user_config_file() {
        Some(user) if user.exists() => user,
        _ => system_config_file(),
    }
}
