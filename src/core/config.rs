//! Configuration management for the MCP host server.
//!
//! This module provides a centralized configuration structure that can be
//! populated from environment variables or defaults.

use super::transport::HttpConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::domains::isolation::IsolationOptions;

/// Dependencies that plugins must always share with the host process.
///
/// Values of these libraries travel back into host APIs, so a plugin may
/// never bring its own copy.
pub const DEFAULT_HOST_SHARED_DEPENDENCIES: &[&str] = &["host-api", "host-geometry"];

/// Main configuration structure for the MCP host server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server identification and metadata.
    pub server: ServerConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// HTTP transport configuration.
    pub transport: HttpConfig,

    /// Plugin discovery and isolation configuration.
    pub plugins: PluginsConfig,
}

/// Server identification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The name of the server as reported to clients.
    pub name: String,

    /// The version of the server.
    pub version: String,

    /// Instructions returned to clients during initialization.
    pub instructions: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "trace").
    pub level: String,

    /// Directory for the log file. Created if absent; `None` logs to stderr only.
    pub directory: Option<PathBuf>,

    /// Name of the log file inside `directory`.
    pub file_name: String,
}

/// Configuration for plugin loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directory scanned for `*.mcp-plugin` packages.
    pub directory: Option<PathBuf>,

    /// Directory holding the host's own copies of shared libraries.
    pub host_library_dir: Option<PathBuf>,

    /// Dependency names that always resolve to the host's copy.
    pub host_shared_dependencies: Vec<String>,

    /// Timeout for a single request to a plugin process.
    pub request_timeout_secs: u64,

    /// Grace period for a plugin process to exit on unload.
    pub unload_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "host-mcp-server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: Some(
                "Exposes host application tools. Call tools/list to discover them.".to_string(),
            ),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_name: "mcp-host.log".to_string(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            host_library_dir: None,
            host_shared_dependencies: DEFAULT_HOST_SHARED_DEPENDENCIES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            request_timeout_secs: 120,
            unload_timeout_ms: 2_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            transport: HttpConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

impl PluginsConfig {
    /// Isolation settings derived from this configuration.
    pub fn isolation_options(&self) -> IsolationOptions {
        IsolationOptions {
            host_library_dir: self.host_library_dir.clone(),
            host_shared_dependencies: self.host_shared_dependencies.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            unload_timeout: Duration::from_millis(self.unload_timeout_ms),
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables are expected to be prefixed with `MCP_`.
    /// For example: `MCP_SERVER_NAME`, `MCP_LOG_LEVEL`, `MCP_PLUGIN_DIR`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(name) = std::env::var("MCP_SERVER_NAME") {
            config.server.name = name;
        }

        if let Ok(level) = std::env::var("MCP_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(dir) = std::env::var("MCP_LOG_DIR") {
            config.logging.directory = Some(PathBuf::from(dir));
        }

        config.transport = HttpConfig::from_env();

        if let Ok(dir) = std::env::var("MCP_PLUGIN_DIR") {
            config.plugins.directory = Some(PathBuf::from(dir));
            info!("Plugin directory set to {:?}", config.plugins.directory);
        } else {
            warn!("MCP_PLUGIN_DIR not set - only in-process tools will be available");
        }

        if let Ok(dir) = std::env::var("MCP_HOST_LIBRARY_DIR") {
            config.plugins.host_library_dir = Some(PathBuf::from(dir));
        }

        if let Ok(names) = std::env::var("MCP_HOST_SHARED_DEPENDENCIES") {
            config.plugins.host_shared_dependencies = names
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(secs) = std::env::var("MCP_PLUGIN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.plugins.request_timeout_secs = secs;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests run serially
    static ENV_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_plugin_dir_from_env() {
        let _lock = ENV_TEST_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("MCP_PLUGIN_DIR", "/opt/host/plugins");
            std::env::set_var("MCP_HOST_SHARED_DEPENDENCIES", "geom, ui ,");
        }
        let config = Config::from_env();
        assert_eq!(
            config.plugins.directory.as_deref(),
            Some(std::path::Path::new("/opt/host/plugins"))
        );
        assert_eq!(config.plugins.host_shared_dependencies, vec!["geom", "ui"]);
        unsafe {
            std::env::remove_var("MCP_PLUGIN_DIR");
            std::env::remove_var("MCP_HOST_SHARED_DEPENDENCIES");
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = ENV_TEST_LOCK.lock().unwrap();
        let config = Config::default();
        assert!(config.plugins.directory.is_none());
        assert_eq!(config.logging.file_name, "mcp-host.log");
        assert!(
            config
                .plugins
                .host_shared_dependencies
                .contains(&"host-geometry".to_string())
        );
    }

    #[test]
    fn test_isolation_options() {
        let plugins = PluginsConfig {
            request_timeout_secs: 5,
            unload_timeout_ms: 250,
            ..PluginsConfig::default()
        };
        let options = plugins.isolation_options();
        assert_eq!(options.request_timeout, Duration::from_secs(5));
        assert_eq!(options.unload_timeout, Duration::from_millis(250));
    }
}
