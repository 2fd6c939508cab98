//! MCP Host Library
//!
//! An MCP server embedded in a host application. Clients talk to it over
//! streamable HTTP (JSON-RPC over POST, answers and notifications as SSE);
//! tools come from in-process entries or from plugin packages that each run
//! in their own process with their own dependencies.
//!
//! # Architecture
//!
//! - **core**: configuration, errors, the per-session protocol runtime, the
//!   HTTP transport and session table, and the host lifecycle
//! - **domains**: business logic organized by bounded contexts
//!   - **tools**: tool handlers, the registry and the text-only executor boundary
//!   - **isolation**: plugin processes, dependency resolution and the line protocol
//!
//! # Example
//!
//! ```rust,no_run
//! use host_mcp_server::core::{Config, McpHost};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let host = McpHost::start(Config::from_env(), CancellationToken::new()).await?;
//!     println!("listening on {}", host.endpoint_url());
//!     tokio::signal::ctrl_c().await?;
//!     host.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod domains;

// Re-export commonly used types for convenience
pub use core::{Config, Error, McpHost, McpServer, Result};
