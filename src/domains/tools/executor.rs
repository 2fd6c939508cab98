//! The boundary through which the protocol runtime runs tools.
//!
//! Exactly two operations cross it, and both are text in, text out:
//!
//! - `list_tools_as_text()`: JSON array of `{name, description, inputSchema}`
//! - `execute_tool(name, arguments_json)`: JSON `{isError, content}`
//!
//! Nothing that fails behind the boundary escapes as an error or a panic; it
//! comes back as an `isError` result instead.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use rmcp::model::CallToolResult;
use serde_json::{Value, json};
use tracing::{error, warn};

use super::registry::ToolRegistry;

/// Text-only tool execution.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    /// All tools as a JSON array.
    async fn list_tools_as_text(&self) -> String;

    /// Run one tool; always returns a JSON tool result.
    async fn execute_tool(&self, name: &str, arguments_json: &str) -> String;
}

/// `{"isError":true,"content":[{"type":"text","text":message}]}`.
pub fn error_result_text(message: impl Into<String>) -> String {
    json!({
        "isError": true,
        "content": [{ "type": "text", "text": message.into() }]
    })
    .to_string()
}

/// Wire text of a tool result.
pub fn result_text(result: CallToolResult) -> String {
    let mut response = json!({
        "content": result.content,
        "isError": result.is_error.unwrap_or(false)
    });
    if let (Some(structured), Some(object)) = (result.structured_content, response.as_object_mut())
    {
        object.insert("structuredContent".to_string(), structured);
    }
    response.to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Adapter exposing a [`ToolRegistry`] through the boundary.
pub struct RegistryExecutor {
    registry: Arc<ToolRegistry>,
}

impl RegistryExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for RegistryExecutor {
    async fn list_tools_as_text(&self) -> String {
        let descriptors = self.registry.descriptors().await;
        serde_json::to_string(&descriptors).unwrap_or_else(|e| {
            error!("Failed to serialize tool list: {}", e);
            "[]".to_string()
        })
    }

    async fn execute_tool(&self, name: &str, arguments_json: &str) -> String {
        let run = self.registry.execute_text(name, arguments_json);

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("Tool {} failed: {}", name, e);
                error_result_text(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Tool {} panicked: {}", name, message);
                error_result_text(format!("Tool {name} panicked: {message}"))
            }
        }
    }
}

/// Function returning the tool list text.
pub type ListToolsFn = Arc<dyn Fn() -> BoxFuture<'static, String> + Send + Sync>;

/// Function executing `(name, arguments_json)` and returning result text.
pub type ExecuteToolFn = Arc<dyn Fn(String, String) -> BoxFuture<'static, String> + Send + Sync>;

/// The boundary as two plain function references.
///
/// This is what the runtime is handed: it carries no registry or plugin type.
#[derive(Clone)]
pub struct ExecutorFns {
    pub list_tools: ListToolsFn,
    pub execute_tool: ExecuteToolFn,
}

impl ExecutorFns {
    pub fn new<L, E>(list_tools: L, execute_tool: E) -> Self
    where
        L: Fn() -> BoxFuture<'static, String> + Send + Sync + 'static,
        E: Fn(String, String) -> BoxFuture<'static, String> + Send + Sync + 'static,
    {
        Self {
            list_tools: Arc::new(list_tools),
            execute_tool: Arc::new(execute_tool),
        }
    }

    /// Capture `executor`'s two operations as function references.
    pub fn from_executor(executor: Arc<dyn ToolExecutor>) -> Self {
        let lister = executor.clone();
        Self::new(
            move || {
                let executor = lister.clone();
                async move { executor.list_tools_as_text().await }.boxed()
            },
            move |name, arguments| {
                let executor = executor.clone();
                async move { executor.execute_tool(&name, &arguments).await }.boxed()
            },
        )
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ExecutorFns {
    async fn list_tools_as_text(&self) -> String {
        (self.list_tools)().await
    }

    async fn execute_tool(&self, name: &str, arguments_json: &str) -> String {
        (self.execute_tool)(name.to_string(), arguments_json.to_string()).await
    }
}

/// Whether a result text reports an error.
pub fn is_error_result(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("isError").and_then(Value::as_bool))
        .unwrap_or(true)
}
