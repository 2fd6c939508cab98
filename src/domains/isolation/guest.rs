//! Plugin side of the line protocol.
//!
//! A plugin binary written in Rust builds a [`PluginEntry`] and hands it to
//! [`serve_stdio`]; everything else (registration, argument parsing, error
//! and panic conversion) is shared with the host.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use super::IsolationOptions;
use super::protocol::PluginRequest;
use crate::domains::tools::{
    PluginEntry, RegistryExecutor, ToolExecutor, ToolRegistry, error_result_text,
};

/// Answer protocol requests read from `reader` until `shutdown` or end of input.
pub async fn serve<R, W>(entry: PluginEntry, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let registry = Arc::new(ToolRegistry::new(IsolationOptions::default()));
    registry.register_entry(entry).await;
    let executor = RegistryExecutor::new(registry);

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match PluginRequest::decode(&line) {
            Ok(PluginRequest::ListTools) => executor.list_tools_as_text().await,
            Ok(PluginRequest::ExecuteTool { name, arguments }) => {
                executor.execute_tool(&name, &arguments.to_string()).await
            }
            Ok(PluginRequest::Shutdown) => {
                debug!("Shutdown requested");
                break;
            }
            Err(e) => {
                warn!("Bad request from host: {}", e);
                error_result_text(e.to_string())
            }
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

/// [`serve`] over the process's stdin and stdout.
pub async fn serve_stdio(entry: PluginEntry) -> std::io::Result<()> {
    serve(
        entry,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::tools::{ToolError, ToolHandler};
    use rmcp::model::{CallToolResult, Content, JsonObject};
    use serde_json::Value;
    use tokio::io::AsyncReadExt;

    struct LenTool;

    #[async_trait::async_trait]
    impl ToolHandler for LenTool {
        fn name(&self) -> &str {
            "len"
        }

        fn description(&self) -> &str {
            "Length of the text argument"
        }

        fn input_schema(&self) -> Arc<JsonObject> {
            Arc::new(JsonObject::new())
        }

        async fn execute(&self, arguments: Value) -> Result<CallToolResult, ToolError> {
            let text = arguments.get("text").and_then(Value::as_str).unwrap_or("");
            Ok(CallToolResult::success(vec![Content::text(
                text.len().to_string(),
            )]))
        }
    }

    async fn exchange(input: &str) -> Vec<String> {
        let (mut host, plugin) = tokio::io::duplex(8192);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);

        let entry = PluginEntry::new("guest").with_tool(|| LenTool);
        let server = tokio::spawn(serve(entry, BufReader::new(plugin_read), plugin_write));

        host.write_all(input.as_bytes()).await.unwrap();
        server.await.unwrap().unwrap();

        let mut output = String::new();
        host.read_to_string(&mut output).await.unwrap();
        output.lines().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn test_answers_one_line_per_request() {
        let replies = exchange("list_tools\nexecute_tool\tlen\t{\"text\":\"four\"}\nshutdown\n").await;

        assert_eq!(replies.len(), 2);
        let tools: Vec<Value> = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(tools[0]["name"], "len");
        let result: Value = serde_json::from_str(&replies[1]).unwrap();
        assert_eq!(result["content"][0]["text"], "4");
    }

    #[tokio::test]
    async fn test_bad_request_gets_error_line() {
        let replies = exchange("bogus\nexecute_tool\tmissing\t{}\nshutdown\n").await;

        assert_eq!(replies.len(), 2);
        for reply in replies {
            let value: Value = serde_json::from_str(&reply).unwrap();
            assert_eq!(value["isError"], true);
        }
    }
}
