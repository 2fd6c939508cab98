//! Domains module containing business logic organized by bounded contexts.
//!
//! - **tools**: tool handlers, the registry and the executor boundary
//! - **isolation**: plugin processes, dependency resolution and the line protocol

pub mod isolation;
pub mod tools;
