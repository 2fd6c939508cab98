//! Sample tool plugin.
//!
//! Copy the built binary into the plugin directory as `echo.mcp-plugin`; the
//! host runs it in its own process and talks to it over stdin/stdout.

use std::sync::Arc;

use rmcp::{
    handler::server::tool::schema_for_type,
    model::{CallToolResult, Content, JsonObject},
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};
use tracing_subscriber::{EnvFilter, fmt};

use host_mcp_server::domains::isolation::guest;
use host_mcp_server::domains::tools::{PluginEntry, ToolError, ToolHandler};

// ============================================================================
// Tool Parameters
// ============================================================================

/// Parameters for the echo tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct EchoParams {
    /// Text to send back.
    text: String,

    /// Repeat the text this many times.
    #[serde(default)]
    repeat: Option<u32>,
}

/// Parameters for the dependency report; none.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct NoParams {}

// ============================================================================
// Tool Definitions
// ============================================================================

/// Echo tool - returns its input.
struct EchoTool;

#[async_trait::async_trait]
impl ToolHandler for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back, optionally repeated."
    }

    fn input_schema(&self) -> Arc<JsonObject> {
        Arc::new(schema_for_type::<EchoParams>())
    }

    #[instrument(skip_all)]
    async fn execute(&self, arguments: Value) -> Result<CallToolResult, ToolError> {
        let params: EchoParams = serde_json::from_value(arguments)
            .map_err(|e| ToolError::invalid_arguments(e.to_string()))?;

        let repeat = params.repeat.unwrap_or(1).clamp(1, 100) as usize;
        debug!("Echoing {} byte(s) x{}", params.text.len(), repeat);

        Ok(CallToolResult::success(vec![Content::text(
            params.text.repeat(repeat),
        )]))
    }
}

/// Reports the dependencies the host resolved for this process.
struct DescribeDependenciesTool;

#[async_trait::async_trait]
impl ToolHandler for DescribeDependenciesTool {
    fn name(&self) -> &str {
        "describe_dependencies"
    }

    fn description(&self) -> &str {
        "List the plugin's resolved dependencies and where each was found."
    }

    fn input_schema(&self) -> Arc<JsonObject> {
        Arc::new(schema_for_type::<NoParams>())
    }

    async fn execute(&self, arguments: Value) -> Result<CallToolResult, ToolError> {
        let NoParams {} = serde_json::from_value(arguments)
            .map_err(|e| ToolError::invalid_arguments(e.to_string()))?;

        let mut dependencies: Vec<(String, String)> = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix("MCP_DEP_")
                    .map(|name| (name.to_lowercase(), value))
            })
            .collect();
        dependencies.sort();

        let report = json!({
            "plugin": std::env::var("MCP_PLUGIN_NAME").ok(),
            "directory": std::env::var("MCP_PLUGIN_DIR").ok(),
            "dependencies": dependencies
                .into_iter()
                .map(|(name, path)| json!({ "name": name, "path": path }))
                .collect::<Vec<_>>(),
        });

        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| ToolError::execution_failed(e.to_string()))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol; logs go to stderr, which the host forwards.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MCP_PLUGIN_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let entry = PluginEntry::new("echo")
        .with_tool(|| EchoTool)
        .with_tool(|| DescribeDependenciesTool);

    guest::serve_stdio(entry).await?;
    Ok(())
}
