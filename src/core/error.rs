//! Error types and handling for the MCP host server.
//!
//! This module defines a unified error type that can represent errors from
//! all domains and external dependencies, providing consistent error handling
//! across the entire application.

use thiserror::Error;

/// A specialized Result type for MCP host operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the MCP host server.
///
/// This enum captures all possible error conditions that can occur during
/// server operation, including domain-specific errors and external failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Error originating from the tools domain.
    #[error("Tool error: {0}")]
    Tool(#[from] crate::domains::tools::ToolError),

    /// Error originating from the plugin isolation layer.
    #[error("Isolation error: {0}")]
    Isolation(#[from] crate::domains::isolation::IsolationError),

    /// Error originating from the HTTP transport or session layer.
    #[error("Transport error: {0}")]
    Transport(#[from] crate::core::transport::TransportError),

    /// I/O errors from file operations or network communication.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors that should not occur under normal operation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
