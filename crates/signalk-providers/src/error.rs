//! Provider error types.

use thiserror::Error;

/// Errors raised while building or running a provider pipeline.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Unknown transport or protocol, missing option, incompatible pair.
    /// Raised while the pipeline is built, before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connect refused, timeout, idle timeout.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed sentence, frame or JSON.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
