use thiserror::Error;

#[derive(Error, Debug)]
pub enum FacegateError {
    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User {0} is busy in another session")]
    UserBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FacegateError>;
