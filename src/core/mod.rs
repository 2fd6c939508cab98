//! Core module containing shared infrastructure components.
//!
//! This module provides the foundational building blocks for the MCP host,
//! including error handling, configuration, the per-session protocol runtime,
//! the streamable HTTP transport and the host lifecycle.

pub mod config;
pub mod error;
pub mod host;
pub mod server;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use host::McpHost;
pub use server::McpServer;
pub use transport::{HttpConfig, HttpTransport, SessionManager};
