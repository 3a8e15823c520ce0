pub mod capture;

pub use capture::{FrameSource, HelperCapture, DEVICE_ENV};
