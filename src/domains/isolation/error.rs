//! Isolation-specific error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for isolation operations.
pub type IsolationResult<T> = Result<T, IsolationError>;

/// Errors that can occur while loading or talking to an isolated plugin.
#[derive(Debug, Error)]
pub enum IsolationError {
    /// The primary module file does not exist.
    #[error("Plugin module not found: {}", .0.display())]
    ModuleNotFound(PathBuf),

    /// The dependency manifest could not be read or parsed.
    #[error("Invalid manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },

    /// The plugin process could not be started.
    #[error("Failed to start plugin {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while preparing or talking to the plugin.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The plugin answered outside the line protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The plugin did not answer in time.
    #[error("Plugin did not answer within {0:?}")]
    Timeout(Duration),

    /// The plugin process exited.
    #[error("Plugin process for {0} has exited")]
    Exited(String),

    /// The context was unloaded; nothing obtained through it may be used.
    #[error("Isolation context {0} has been unloaded")]
    Unloaded(String),
}

impl IsolationError {
    /// Create a manifest error.
    pub fn manifest(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a spawn error.
    pub fn spawn(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            source,
        }
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
