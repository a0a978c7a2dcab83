//! Plugin error types.

use thiserror::Error;

/// Errors raised by plugin lookup or by a plugin call.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already registered: {0}")]
    AlreadyRegistered(String),

    #[error("plugin registry lock poisoned")]
    Poisoned,

    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("plugin call failed: {0}")]
    Call(String),

    #[error("remote plugin error: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;
