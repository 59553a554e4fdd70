//! Error types for PetalScape

use crate::handle::Handle;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PetalScapeError {
    #[error("Invalid handle: {0}")]
    InvalidHandle(Handle),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transform: {0}")]
    InvalidTransform(String),

    #[error("Parameter type error: {0}")]
    ParameterType(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Engine is not running")]
    EngineNotRunning,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ring buffer error: {0}")]
    RingBuffer(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, PetalScapeError>;
