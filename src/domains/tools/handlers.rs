//! In-process tool handlers and plugin entry points.
//!
//! A plugin never hands the registry a ready-made tool. It exposes a
//! [`PluginEntry`]: a list of factories the registry invokes one by one, so a
//! factory that fails costs only its own tool.

use std::sync::Arc;

use rmcp::model::{CallToolResult, JsonObject, Tool};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ToolError;

/// Name, description and input schema of one tool.
///
/// Serializes to the `{name, description, inputSchema}` shape of `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl From<&Tool> for ToolDescriptor {
    fn from(tool: &Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool
                .description
                .as_deref()
                .map(str::to_string)
                .unwrap_or_default(),
            input_schema: Value::Object(tool.input_schema.as_ref().clone()),
        }
    }
}

/// A tool that runs inside the host process.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Get the name of this tool.
    fn name(&self) -> &str;

    /// Get the description of this tool.
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn input_schema(&self) -> Arc<JsonObject>;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: Value) -> Result<CallToolResult, ToolError>;

    /// Tool model as listed to clients.
    fn to_tool(&self) -> Tool {
        Tool {
            name: self.name().to_string().into(),
            description: Some(self.description().to_string().into()),
            input_schema: self.input_schema(),
            annotations: None,
            output_schema: None,
            icons: None,
            meta: None,
            title: None,
        }
    }

    /// Descriptor as exchanged across the executor boundary.
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::from(&self.to_tool())
    }
}

/// Produces one tool instance.
pub type ToolFactory = Box<dyn Fn() -> Result<Box<dyn ToolHandler>, ToolError> + Send + Sync>;

/// Entry point of an in-process plugin.
pub struct PluginEntry {
    /// Plugin name, used in logs.
    pub name: String,

    /// One factory per tool.
    pub factories: Vec<ToolFactory>,
}

impl PluginEntry {
    /// Create an entry without factories.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factories: Vec::new(),
        }
    }

    /// Add a factory.
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn ToolHandler>, ToolError> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }

    /// Add a factory built from an infallible constructor.
    pub fn with_tool<H, C>(self, constructor: C) -> Self
    where
        H: ToolHandler + 'static,
        C: Fn() -> H + Send + Sync + 'static,
    {
        self.with_factory(move || Ok(Box::new(constructor()) as Box<dyn ToolHandler>))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::handler::server::tool::schema_for_type;
    use rmcp::model::Content;
    use schemars::JsonSchema;

    #[derive(Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct GreetParams {
        /// Who to greet.
        name: String,
    }

    struct GreetTool;

    #[async_trait::async_trait]
    impl ToolHandler for GreetTool {
        fn name(&self) -> &str {
            "greet"
        }

        fn description(&self) -> &str {
            "Say hello"
        }

        fn input_schema(&self) -> Arc<JsonObject> {
            Arc::new(schema_for_type::<GreetParams>())
        }

        async fn execute(&self, _arguments: Value) -> Result<CallToolResult, ToolError> {
            Ok(CallToolResult::success(vec![Content::text("hello")]))
        }
    }

    #[test]
    fn test_descriptor_shape() {
        let value = serde_json::to_value(GreetTool.descriptor()).unwrap();
        assert_eq!(value["name"], "greet");
        assert_eq!(value["description"], "Say hello");
        assert_eq!(value["inputSchema"]["type"], "object");
        assert!(value["inputSchema"]["properties"]["name"].is_object());
    }

    #[test]
    fn test_entry_builders() {
        let entry = PluginEntry::new("demo")
            .with_tool(|| GreetTool)
            .with_factory(|| Err(ToolError::factory("broken")));
        assert_eq!(entry.factories.len(), 2);
        assert!((entry.factories[0])().is_ok());
        assert!((entry.factories[1])().is_err());
    }
}
