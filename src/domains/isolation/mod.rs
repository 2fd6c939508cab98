//! Plugin isolation domain.
//!
//! Each plugin package runs in its own [`IsolationContext`]: a child process
//! started from a private shadow copy of the module, with its own resolved
//! dependency set. Contexts load and unload independently of each other and
//! of the host.
//!
//! ## Architecture
//!
//! - `manifest.rs` - Package naming and `<name>.deps.json` manifests
//! - `resolver.rs` - Manifest → directory → host dependency resolution
//! - `protocol.rs` - Line protocol spoken over the plugin's stdin/stdout
//! - `context.rs` - Process lifecycle, request exchange and unload
//! - `guest.rs` - Plugin-side protocol loop for plugins written in Rust

mod context;
mod error;
pub mod guest;
pub mod manifest;
pub mod protocol;
pub mod resolver;

#[cfg(test)]
pub(crate) mod fixtures;

pub use context::{IsolationContext, IsolationOptions};
pub use error::{IsolationError, IsolationResult};
pub use manifest::{PLUGIN_SUFFIX, PluginManifest, has_plugin_suffix, plugin_name};
pub use resolver::{DependencyResolver, ResolutionSource, ResolvedDependency};
