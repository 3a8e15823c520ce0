// Core modules
pub mod common;
pub mod core;
pub mod camera;
pub mod storage;
pub mod service;

// Re-export commonly used types
pub use common::{Config, FacegateError, Isolation, Result};
pub use core::{best_distance, Descriptor, DescriptorEngine, DescriptorSet, Nearest};
pub use camera::{FrameSource, HelperCapture};
pub use storage::{ModelPolicy, ModelStore, SampleStore};
pub use service::{protocol, RequestHandler, Server, ServiceClient, SessionHandler};
