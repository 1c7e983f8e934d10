use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Engine executable not found or not a file: {}", .0.display())]
    InvalidExecutable(PathBuf),
    #[error("Engine process not running")]
    NotRunning,
    #[error("Engine timeout while waiting for {0}")]
    Timeout(&'static str),
    #[error("Cache store error: {0}")]
    Cache(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
