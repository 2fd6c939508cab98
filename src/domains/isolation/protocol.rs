//! Line protocol between the host and a plugin process.
//!
//! Every message is one line of UTF-8 text. The host sends:
//!
//! - `list_tools`
//! - `execute_tool\t<name>\t<arguments-json>`
//! - `shutdown`
//!
//! and the plugin answers each of the first two with exactly one line: a JSON
//! array of tool descriptors, or a JSON tool result. `shutdown` is not
//! answered; the plugin exits.

use serde_json::Value;

use super::{IsolationError, IsolationResult};

const LIST_TOOLS: &str = "list_tools";
const EXECUTE_TOOL: &str = "execute_tool";
const SHUTDOWN: &str = "shutdown";

/// A request from host to plugin.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginRequest {
    ListTools,
    ExecuteTool { name: String, arguments: Value },
    Shutdown,
}

impl PluginRequest {
    /// Build an `execute_tool` request from argument text.
    pub fn execute(name: &str, arguments_json: &str) -> IsolationResult<Self> {
        if name.is_empty() || name.contains(['\t', '\n', '\r']) {
            return Err(IsolationError::protocol(format!("invalid tool name {name:?}")));
        }
        let arguments = serde_json::from_str(arguments_json)
            .map_err(|e| IsolationError::protocol(format!("invalid tool arguments: {e}")))?;

        Ok(Self::ExecuteTool {
            name: name.to_string(),
            arguments,
        })
    }

    /// Encode as one line, without the terminator.
    ///
    /// Compact JSON never contains raw line breaks or tabs, so the arguments
    /// always stay in their field.
    pub fn encode(&self) -> String {
        match self {
            Self::ListTools => LIST_TOOLS.to_string(),
            Self::ExecuteTool { name, arguments } => {
                format!("{EXECUTE_TOOL}\t{name}\t{arguments}")
            }
            Self::Shutdown => SHUTDOWN.to_string(),
        }
    }

    /// Decode one line, with or without its terminator.
    pub fn decode(line: &str) -> IsolationResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        let mut fields = line.splitn(3, '\t');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(LIST_TOOLS), None, None) => Ok(Self::ListTools),
            (Some(SHUTDOWN), None, None) => Ok(Self::Shutdown),
            (Some(EXECUTE_TOOL), Some(name), arguments) => {
                Self::execute(name, arguments.filter(|a| !a.is_empty()).unwrap_or("{}"))
            }
            _ => Err(IsolationError::protocol(format!("unknown request {line:?}"))),
        }
    }
}
