//! Protocol runtime serving one session.
//!
//! The runtime reads JSON-RPC messages from a [`StreamableTransport`] and
//! answers `initialize`, `ping`, `tools/list` and `tools/call`. Tools are
//! reached only through a [`ToolExecutor`], so the runtime never touches a
//! plugin's types: tool lists and results cross as text.

use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::Config;
use super::transport::message::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use super::transport::streamable::StreamableTransport;
use crate::domains::tools::ToolExecutor;

/// Protocol versions this runtime can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Per-session protocol runtime.
#[derive(Clone)]
pub struct McpServer {
    /// Server configuration.
    config: Arc<Config>,

    /// The only channel to tools.
    executor: Arc<dyn ToolExecutor>,
}

impl McpServer {
    /// Create a runtime that executes tools through `executor`.
    pub fn new(config: Arc<Config>, executor: Arc<dyn ToolExecutor>) -> Self {
        Self { config, executor }
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.config.server.name
    }

    /// Get the server version.
    pub fn version(&self) -> &str {
        &self.config.server.version
    }

    /// Serve `transport` until it closes or `cancel` fires.
    pub async fn run(self, transport: Arc<StreamableTransport>, cancel: CancellationToken) {
        let session_id = transport.session_id().to_string();
        debug!(session_id = %session_id, "Protocol runtime started");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = transport.receive() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let reply = tokio::select! {
                _ = cancel.cancelled() => break,
                reply = self.handle_message(message, &transport) => reply,
            };
            let Some(reply) = reply else {
                continue;
            };

            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = transport.send_message(reply) => sent,
            };
            match sent {
                Ok(()) => {}
                Err(e) if e.is_closed() => break,
                Err(e) => warn!(session_id = %session_id, "Failed to queue reply: {}", e),
            }
        }

        debug!(session_id = %session_id, "Protocol runtime stopped");
    }

    /// Handle one client message, returning the reply if one is due.
    ///
    /// Notifications and responses from the client are consumed silently.
    pub async fn handle_message(
        &self,
        message: JsonRpcMessage,
        transport: &StreamableTransport,
    ) -> Option<JsonRpcMessage> {
        match message {
            JsonRpcMessage::Request(request) => {
                Some(self.handle_request(request, transport).await.into())
            }
            JsonRpcMessage::Notification(notification) => {
                handle_notification(&notification);
                None
            }
            JsonRpcMessage::Response(response) => {
                debug!(id = %response.id, "Ignoring client response");
                None
            }
        }
    }

    #[instrument(skip_all, fields(method = %request.method))]
    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        transport: &StreamableTransport,
    ) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request),
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            "tools/list" => self.handle_tools_list(request).await,
            "tools/call" => self.handle_tools_call(request, transport).await,
            method => {
                warn!("Unknown method: {}", method);
                JsonRpcResponse::method_not_found(request.id, method)
            }
        }
    }

    fn handle_initialize(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let requested = request
            .params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let protocol_version = negotiate_protocol_version(requested);

        info!(
            "Initializing session (client requested {:?}, using {})",
            requested, protocol_version
        );

        let mut result = json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": self.name(),
                "version": self.version()
            }
        });
        if let (Some(instructions), Some(object)) = (
            self.config.server.instructions.as_ref(),
            result.as_object_mut(),
        ) {
            object.insert("instructions".to_string(), json!(instructions));
        }

        JsonRpcResponse::success(request.id, result)
    }

    async fn handle_tools_list(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let text = self.executor.list_tools_as_text().await;

        match serde_json::from_str::<Vec<Value>>(&text) {
            Ok(tools) => {
                debug!("Listing {} tool(s)", tools.len());
                JsonRpcResponse::success(request.id, json!({ "tools": tools }))
            }
            Err(e) => {
                warn!("Executor returned an unreadable tool list: {}", e);
                JsonRpcResponse::internal_error(request.id, format!("Invalid tool list: {e}"))
            }
        }
    }

    async fn handle_tools_call(
        &self,
        request: JsonRpcRequest,
        transport: &StreamableTransport,
    ) -> JsonRpcResponse {
        let Some(params) = request.params.as_ref() else {
            return JsonRpcResponse::invalid_params(request.id, "Missing params");
        };

        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::invalid_params(request.id, "Missing tool name");
        };

        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => "{}".to_string(),
            Some(arguments @ Value::Object(_)) => arguments.to_string(),
            Some(_) => {
                return JsonRpcResponse::invalid_params(request.id, "Tool arguments must be an object");
            }
        };

        let progress_token = params
            .get("_meta")
            .and_then(|meta| meta.get("progressToken"))
            .cloned();

        info!("Calling tool: {}", name);
        if let Some(token) = &progress_token {
            report_progress(transport, token, 0, format!("Running {name}")).await;
        }

        let text = self.executor.execute_tool(name, &arguments).await;

        if let Some(token) = &progress_token {
            report_progress(transport, token, 1, format!("Finished {name}")).await;
        }

        let result = serde_json::from_str::<Value>(&text).unwrap_or_else(|e| {
            warn!("Tool {} returned unreadable result: {}", name, e);
            json!({
                "isError": true,
                "content": [{ "type": "text", "text": format!("Invalid tool result: {e}") }]
            })
        });

        JsonRpcResponse::success(request.id, result)
    }
}

/// Pick the client's version when supported, otherwise the newest one.
pub fn negotiate_protocol_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|version| {
            SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .copied()
                .find(|supported| *supported == version)
        })
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
}

fn handle_notification(notification: &JsonRpcNotification) {
    match notification.method.as_str() {
        "notifications/initialized" => info!("Client sent initialized notification"),
        "notifications/cancelled" => debug!("Client cancelled a request"),
        method => debug!("Received notification: {}", method),
    }
}

async fn report_progress(
    transport: &StreamableTransport,
    token: &Value,
    progress: u32,
    message: String,
) {
    let notification = JsonRpcNotification::new(
        "notifications/progress",
        Some(json!({
            "progressToken": token,
            "progress": progress,
            "total": 1,
            "message": message
        })),
    );

    if let Err(e) = transport.send_message(notification.into()).await {
        debug!("Dropping progress notification: {}", e);
    }
}
