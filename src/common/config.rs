use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::common::error::{FacegateError, Result};
use crate::common::paths;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
}

/// How each accepted connection is isolated from the listener and from its siblings.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One forked child process per connection.
    #[default]
    Fork,
    /// One thread per connection with panic containment.
    Thread,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub isolation: Isolation,
    #[serde(default = "default_true")]
    pub ignore_sigpipe: bool,
    #[serde(default = "default_true")]
    pub auto_reap_children: bool,
}

fn default_socket_path() -> PathBuf { paths::system_socket_path() }
fn default_socket_mode() -> u32 { 0o660 }
fn default_max_request_bytes() -> usize { 64 * 1024 }
fn default_read_timeout() -> u64 { 5000 }
fn default_true() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            max_request_bytes: default_max_request_bytes(),
            read_timeout_ms: default_read_timeout(),
            isolation: Isolation::default(),
            ignore_sigpipe: true,
            auto_reap_children: true,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf { paths::system_data_dir() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default = "default_helper_path")]
    pub helper_path: PathBuf,
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_frame_side")]
    pub width: u32,
    #[serde(default = "default_frame_side")]
    pub height: u32,
    #[serde(default = "default_capture_timeout")]
    pub timeout_ms: u64,
}

fn default_helper_path() -> PathBuf { paths::system_camera_helper() }
fn default_frame_side() -> u32 { 200 }
fn default_capture_timeout() -> u64 { 2000 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            helper_path: default_helper_path(),
            device_index: 0,
            width: default_frame_side(),
            height: default_frame_side(),
            timeout_ms: default_capture_timeout(),
        }
    }
}

impl CameraConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
    #[serde(default = "default_target_samples")]
    pub target_samples: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_max_attempts() -> u32 { 30 }
fn default_budget_secs() -> u64 { 12 }
fn default_target_samples() -> usize { 8 }
fn default_min_samples() -> usize { 5 }

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            budget_secs: default_budget_secs(),
            target_samples: default_target_samples(),
            min_samples: default_min_samples(),
        }
    }
}

impl EnrollmentConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatcherConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_true")]
    pub override_policy: bool,
    #[serde(default = "default_grid")]
    pub grid: usize,
}

fn default_threshold() -> f32 { 0.09 }
fn default_grid() -> usize { 8 }

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            override_policy: true,
            grid: default_grid(),
        }
    }
}

impl MatcherConfig {
    /// Threshold actually applied for a model whose policy declares `policy_threshold`.
    pub fn effective_threshold(&self, policy_threshold: f32) -> f32 {
        if self.override_policy {
            self.threshold
        } else {
            policy_threshold
        }
    }
}

impl Config {
    /// Load the system config, falling back to built-in defaults when the file is absent.
    pub fn load() -> Result<Self> {
        let path = paths::system_config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FacegateError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| FacegateError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_request_bytes == 0 {
            return Err(FacegateError::Config("max_request_bytes must be positive".into()));
        }
        if self.server.read_timeout_ms == 0 {
            return Err(FacegateError::Config("read_timeout_ms must be positive".into()));
        }
        if self.server.socket_mode > 0o777 {
            return Err(FacegateError::Config(format!(
                "socket_mode must be a permission mode, got {:o}", self.server.socket_mode
            )));
        }

        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(FacegateError::Config(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(FacegateError::Config(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }
        if self.camera.timeout_ms == 0 {
            return Err(FacegateError::Config("Capture timeout must be positive".into()));
        }

        if self.enrollment.max_attempts == 0 {
            return Err(FacegateError::Config("max_attempts must be positive".into()));
        }
        if self.enrollment.min_samples == 0
            || self.enrollment.min_samples > self.enrollment.target_samples
        {
            return Err(FacegateError::Config(format!(
                "min_samples must be between 1 and target_samples ({}), got {}",
                self.enrollment.target_samples, self.enrollment.min_samples
            )));
        }

        if !(0.0..=2.0).contains(&self.matcher.threshold) {
            return Err(FacegateError::Config(format!(
                "Match threshold must be between 0.0 and 2.0, got {}", self.matcher.threshold
            )));
        }
        if self.matcher.grid == 0 || self.matcher.grid > 200 {
            return Err(FacegateError::Config(format!(
                "Grid must be between 1 and 200, got {}", self.matcher.grid
            )));
        }

        Ok(())
    }
}
