//! Tool Registry - central registration and dispatch for all tools.
//!
//! Tools come from two places:
//! - in-process plugins, registered through a [`PluginEntry`]
//! - plugin packages on disk, each loaded into its own [`IsolationContext`]
//!
//! Names are unique; a later registration replaces an earlier one. The
//! registry changes only while loading or unloading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::executor::result_text;
use super::{PluginEntry, ToolDescriptor, ToolError, ToolHandler};
use crate::domains::isolation::{IsolationContext, IsolationOptions, has_plugin_suffix};

/// Where a registered tool runs.
#[derive(Clone)]
enum ToolSource {
    InProcess(Arc<dyn ToolHandler>),
    Plugin(Arc<IsolationContext>),
}

#[derive(Clone)]
struct RegisteredTool {
    descriptor: ToolDescriptor,
    source: ToolSource,
}

/// Tool registry - indexes every loaded tool by name.
pub struct ToolRegistry {
    options: IsolationOptions,
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
    contexts: Mutex<Vec<Arc<IsolationContext>>>,
}

impl ToolRegistry {
    /// Create an empty registry; plugin packages load with `options`.
    pub fn new(options: IsolationOptions) -> Self {
        Self {
            options,
            tools: RwLock::new(BTreeMap::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    async fn insert(&self, descriptor: ToolDescriptor, source: ToolSource, origin: &str) {
        let name = descriptor.name.clone();
        let previous = self
            .tools
            .write()
            .await
            .insert(name.clone(), RegisteredTool { descriptor, source });

        if previous.is_some() {
            warn!("Tool {} redefined by {}, replacing earlier definition", name, origin);
        } else {
            debug!("Registered tool {} from {}", name, origin);
        }
    }

    /// Register the tools of an in-process plugin.
    ///
    /// Every factory is invoked; one that fails is logged and skipped.
    /// Returns the number of tools registered.
    pub async fn register_entry(&self, entry: PluginEntry) -> usize {
        let mut registered = 0;

        for (index, factory) in entry.factories.iter().enumerate() {
            let handler: Arc<dyn ToolHandler> = match factory() {
                Ok(handler) => Arc::from(handler),
                Err(e) => {
                    warn!("Skipping tool #{} of {}: {}", index, entry.name, e);
                    continue;
                }
            };

            self.insert(handler.descriptor(), ToolSource::InProcess(handler), &entry.name)
                .await;
            registered += 1;
        }

        info!("Registered {} tool(s) from {}", registered, entry.name);
        registered
    }

    /// Load every `*.mcp-plugin` package in `directory`, in name order.
    ///
    /// Each package gets its own isolation context. A package that fails to
    /// load, or a descriptor that cannot be read, is logged and skipped.
    /// Returns the number of tools registered.
    #[instrument(skip(self), fields(directory = %directory.display()))]
    pub async fn load_plugins(&self, directory: &Path) -> Result<usize, ToolError> {
        let is_dir = tokio::fs::metadata(directory)
            .await
            .is_ok_and(|metadata| metadata.is_dir());
        if !is_dir {
            warn!("Plugin directory {} does not exist", directory.display());
            return Ok(0);
        }

        let unreadable =
            |e: std::io::Error| ToolError::internal(format!("cannot read plugin directory: {e}"));
        let mut entries = tokio::fs::read_dir(directory).await.map_err(unreadable)?;
        let mut modules: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let path = entry.path();
            if !has_plugin_suffix(&path) {
                continue;
            }
            // Follows symlinks, unlike `DirEntry::file_type`.
            if tokio::fs::metadata(&path)
                .await
                .is_ok_and(|metadata| metadata.is_file())
            {
                modules.push(path);
            }
        }
        modules.sort();

        let mut registered = 0;
        for module in modules {
            match self.load_package(&module).await {
                Ok(count) => registered += count,
                Err(e) => warn!("Skipping plugin {}: {}", module.display(), e),
            }
        }

        info!("Loaded {} tool(s) from {}", registered, directory.display());
        Ok(registered)
    }

    async fn load_package(&self, module: &Path) -> Result<usize, ToolError> {
        let context = Arc::new(IsolationContext::load(module, &self.options).await?);

        let text = match context.list_tools().await {
            Ok(text) => text,
            Err(e) => {
                context.unload().await;
                return Err(e.into());
            }
        };
        let entries: Vec<Value> = match serde_json::from_str(&text) {
            Ok(entries) => entries,
            Err(e) => {
                context.unload().await;
                return Err(ToolError::internal(format!("unreadable tool list: {e}")));
            }
        };

        self.contexts.lock().await.push(context.clone());

        let mut registered = 0;
        for entry in entries {
            match serde_json::from_value::<ToolDescriptor>(entry) {
                Ok(descriptor) => {
                    self.insert(descriptor, ToolSource::Plugin(context.clone()), context.name())
                        .await;
                    registered += 1;
                }
                Err(e) => warn!("Skipping tool descriptor of {}: {}", context.name(), e),
            }
        }

        Ok(registered)
    }

    /// Clear the registry, then unload every isolation context. Idempotent.
    pub async fn unload_plugins(&self) {
        self.tools.write().await.clear();

        let contexts: Vec<_> = self.contexts.lock().await.drain(..).collect();
        if contexts.is_empty() {
            return;
        }

        info!("Unloading {} plugin(s)", contexts.len());
        for context in contexts {
            context.unload().await;
        }
    }

    /// Run a tool and return its result text.
    ///
    /// Unknown tools and unreadable arguments are errors; the executor turns
    /// them into `isError` results.
    pub async fn execute_text(&self, name: &str, arguments_json: &str) -> Result<String, ToolError> {
        let source = self
            .tools
            .read()
            .await
            .get(name)
            .map(|tool| tool.source.clone())
            .ok_or_else(|| ToolError::not_found(name))?;

        match source {
            ToolSource::InProcess(handler) => {
                let arguments: Value = serde_json::from_str(arguments_json)
                    .map_err(|e| ToolError::invalid_arguments(e.to_string()))?;
                let result = handler.execute(arguments).await?;
                Ok(result_text(result))
            }
            ToolSource::Plugin(context) => Ok(context.execute_tool(name, arguments_json).await?),
        }
    }

    /// Descriptors of all tools, ordered by name.
    pub async fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .await
            .values()
            .map(|tool| tool.descriptor.clone())
            .collect()
    }

    /// Number of registered tools.
    pub async fn tool_count(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Names of all tools, ordered.
    pub async fn tool_names(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    /// Number of live isolation contexts.
    pub async fn context_count(&self) -> usize {
        self.contexts.lock().await.len()
    }
}
