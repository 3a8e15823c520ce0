pub mod config;
pub mod error;
pub mod paths;

pub use config::{Config, Isolation};
pub use error::{FacegateError, Result};
pub use paths::{system_config_file, system_data_dir, system_socket_path, is_safe_user_component};
