//! Tools domain module.
//!
//! This module handles all tool-related functionality for the MCP host.
//! Tools are executable functions that clients call through the protocol
//! runtime; the runtime only ever reaches them through the executor
//! boundary.
//!
//! ## Architecture
//!
//! - `handlers.rs` - In-process tool trait, descriptors and plugin entry points
//! - `registry.rs` - Tool registry and plugin loader
//! - `executor.rs` - Text-only executor boundary (adapter and function references)
//! - `error.rs` - Tool-specific error types

mod error;
mod executor;
mod handlers;
mod registry;

pub use error::ToolError;
pub use executor::{
    ExecuteToolFn, ExecutorFns, ListToolsFn, RegistryExecutor, ToolExecutor, error_result_text,
    is_error_result, result_text,
};
pub use handlers::*;
pub use registry::ToolRegistry;
