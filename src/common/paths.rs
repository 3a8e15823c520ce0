use crate::service::protocol::SOCKET_PATH;
use std::path::{Path, PathBuf};

// System locations; every one of these can be overridden from the config file.

pub fn system_socket_path() -> PathBuf {
    PathBuf::from(SOCKET_PATH)
}

pub fn system_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/facegate")
}

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/facegate/facegate.toml")
}

pub fn system_camera_helper() -> PathBuf {
    PathBuf::from("/usr/lib/facegate/facegate-camera-helper")
}

/// Whether `user` can be used as a single path component under the data directory.
pub fn is_safe_user_component(user: &str) -> bool {
    !user.is_empty()
        && !user.starts_with('.')
        && !user.contains(['/', '\\', '\0'])
        && Path::new(user).components().count() == 1
}
