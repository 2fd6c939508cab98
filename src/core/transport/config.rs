//! Transport configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port number to listen on (0 picks a free port).
    pub port: u16,

    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Path of the streamable MCP endpoint.
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,

    /// Interval between SSE keep-alive comments on push streams (0 disables).
    #[serde(default = "default_keep_alive")]
    pub sse_keep_alive_secs: u64,

    /// Capacity of each session's incoming message queue.
    #[serde(default = "default_incoming_capacity")]
    pub incoming_queue_capacity: usize,

    /// Send an `endpoint` event when a push stream opens.
    #[serde(default = "default_endpoint_event")]
    pub emit_endpoint_event: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_path() -> String {
    "/mcp".to_string()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_incoming_capacity() -> usize {
    32
}

fn default_endpoint_event() -> bool {
    true
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: default_host(),
            rpc_path: default_rpc_path(),
            sse_keep_alive_secs: default_keep_alive(),
            incoming_queue_capacity: default_incoming_capacity(),
            emit_endpoint_event: default_endpoint_event(),
        }
    }
}

impl HttpConfig {
    /// Create an HTTP transport config.
    pub fn new(port: u16, host: impl Into<String>) -> Self {
        Self {
            port,
            host: host.into(),
            ..Default::default()
        }
    }

    /// Load transport config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = std::env::var("MCP_HTTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let host = std::env::var("MCP_HTTP_HOST").unwrap_or(defaults.host);
        let rpc_path = std::env::var("MCP_HTTP_PATH").unwrap_or(defaults.rpc_path);
        let sse_keep_alive_secs = std::env::var("MCP_SSE_KEEP_ALIVE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.sse_keep_alive_secs);
        let incoming_queue_capacity = std::env::var("MCP_INCOMING_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|capacity: &usize| *capacity > 0)
            .unwrap_or(defaults.incoming_queue_capacity);
        let emit_endpoint_event = std::env::var("MCP_SSE_ENDPOINT_EVENT")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(defaults.emit_endpoint_event);

        Self {
            port,
            host,
            rpc_path,
            sse_keep_alive_secs,
            incoming_queue_capacity,
            emit_endpoint_event,
        }
    }

    /// Get the bind address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Keep-alive interval for push streams, if enabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.sse_keep_alive_secs > 0).then(|| Duration::from_secs(self.sse_keep_alive_secs))
    }

    /// Get a description of this transport for logging.
    pub fn description(&self) -> String {
        format!("HTTP on {}:{}{}", self.host, self.port, self.rpc_path)
    }
}
