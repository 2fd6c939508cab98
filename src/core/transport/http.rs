//! HTTP transport implementation.
//!
//! Streamable MCP over HTTP:
//! - `POST /mcp` submits one JSON-RPC message; a request is answered by a
//!   single SSE `message` event, anything else by `202 Accepted`
//! - `GET /mcp` opens the push channel for server notifications
//! - `DELETE /mcp` ends the session
//! - `OPTIONS /mcp` answers CORS preflight
//!
//! Every call except `initialize` names its session in `Mcp-Session-Id`.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

use super::message::JsonRpcMessage;
use super::session::{Session, SessionManager};
use super::sse::SseWriter;
use super::streamable::StreamableTransport;
use super::{HttpConfig, TransportError, TransportResult};
use crate::core::config::Config;
use crate::domains::tools::ToolExecutor;

/// Header carrying the session id.
pub const MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");

const SSE_PIPE_CAPACITY: usize = 64 * 1024;

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live sessions.
    pub sessions: Arc<SessionManager>,
    /// Tool boundary handed to every new session.
    pub executor: Arc<dyn ToolExecutor>,
    /// Transport settings.
    pub config: Arc<HttpConfig>,
    /// Server-wide cancellation; session scopes are its children.
    pub cancel: CancellationToken,
}

impl AppState {
    /// Create state with an empty session table.
    pub fn new(
        config: Arc<Config>,
        executor: Arc<dyn ToolExecutor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new(config.clone())),
            executor,
            config: Arc::new(config.transport.clone()),
            cancel,
        }
    }
}

/// HTTP transport handler.
pub struct HttpTransport {
    config: HttpConfig,
}

impl HttpTransport {
    /// Create a new HTTP transport with the given config.
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }

    /// Get the bind address.
    pub fn address(&self) -> String {
        self.config.address()
    }

    /// Bind the listener.
    pub async fn bind(&self) -> TransportResult<TcpListener> {
        let addr = self.address();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::bind(&addr, e))
    }

    /// Serve `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        state: AppState,
        shutdown: CancellationToken,
    ) -> TransportResult<()> {
        let app = router(state);

        if let Ok(local) = listener.local_addr() {
            info!("Ready - listening on {} (streamable HTTP)", local);
        }
        info!("  → MCP:    POST/GET/DELETE {}", self.config.rpc_path);
        info!("  → Health: GET /health");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| TransportError::http(e.to_string()))?;

        info!("HTTP transport stopped");
        Ok(())
    }
}

/// Build the router for `state`.
pub fn router(state: AppState) -> Router {
    let rpc_path = state.config.rpc_path.clone();

    Router::new()
        .route(
            &rpc_path,
            post(handle_post)
                .get(handle_get)
                .delete(handle_delete)
                .options(handle_options),
        )
        .route("/health", get(health_check))
        .route("/", get(root_handler))
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!("HTTP handler panicked: {}", message);
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn cors_headers() -> [(HeaderName, &'static str); 2] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_EXPOSE_HEADERS, "Mcp-Session-Id"),
    ]
}

fn lookup_session(state: &AppState, headers: &HeaderMap) -> Result<Arc<Session>, Response> {
    let id = headers
        .get(&MCP_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header"))?;

    state
        .sessions
        .get_session(id)
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "Session not found"))
}

/// CORS preflight.
async fn handle_options() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        cors_headers(),
        [
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, DELETE, OPTIONS"),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Content-Type, Accept, Mcp-Session-Id, Last-Event-ID",
            ),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
}

/// Submit one message.
#[instrument(skip_all, fields(method, session_id))]
async fn handle_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let message = match JsonRpcMessage::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!("Rejected malformed message: {}", e);
            return json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON-RPC message: {e}"));
        }
    };
    if let Some(method) = message.method() {
        tracing::Span::current().record("method", method);
    }

    let session = if message.is_initialize_request() {
        let id = SessionManager::generate_session_id();
        match state
            .sessions
            .create_session(&id, state.executor.clone(), &state.cancel)
        {
            Ok(session) => session,
            Err(TransportError::Closed) => {
                return json_error(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down");
            }
            Err(e) => {
                error!("Failed to create session: {}", e);
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session");
            }
        }
    } else {
        match lookup_session(&state, &headers) {
            Ok(session) => session,
            Err(response) => return response,
        }
    };
    tracing::Span::current().record("session_id", session.id());

    let request_id = message
        .is_request()
        .then(|| message.id().cloned().unwrap_or(Value::Null));
    if let Err(e) = session.transport().on_message_received(message).await {
        debug!("Session transport refused message: {}", e);
        return json_error(StatusCode::NOT_FOUND, "Session not found");
    }

    let Some(request_id) = request_id else {
        return (
            StatusCode::ACCEPTED,
            cors_headers(),
            [(MCP_SESSION_ID, session.id().to_string())],
        )
            .into_response();
    };

    stream_response(&session, |transport, writer, cancel| async move {
        transport
            .write_pending_responses(&request_id, &writer, &cancel)
            .await
            .map(|_| ())
    })
}

/// Open the push channel.
#[instrument(skip_all, fields(session_id))]
async fn handle_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = match lookup_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    tracing::Span::current().record("session_id", session.id());
    info!("Push stream opened");

    let endpoint = state
        .config
        .emit_endpoint_event
        .then(|| format!("{}?sessionId={}", state.config.rpc_path, session.id()));

    stream_response(&session, |transport, writer, cancel| async move {
        if let Some(endpoint) = endpoint {
            writer.send_endpoint(&endpoint).await?;
        }
        transport.write_notifications(&writer, &cancel).await
    })
}

/// End a session.
#[instrument(skip_all)]
async fn handle_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(id) = headers
        .get(&MCP_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty())
    else {
        return json_error(StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header");
    };

    if state.sessions.remove_session(id).await {
        (StatusCode::NO_CONTENT, cors_headers()).into_response()
    } else {
        json_error(StatusCode::NOT_FOUND, "Session not found")
    }
}

/// Stream SSE frames produced by `produce` as the response body.
///
/// `produce` runs in its own task under a request scope that is a child of
/// the session scope. Dropping the body (client disconnect) cancels that
/// scope. The writer is disposed exactly once when `produce` returns.
fn stream_response<F, Fut>(session: &Session, produce: F) -> Response
where
    F: FnOnce(
            Arc<StreamableTransport>,
            Arc<SseWriter>,
            CancellationToken,
        ) -> Fut
        + Send
        + 'static,
    Fut: Future<Output = TransportResult<()>> + Send + 'static,
{
    let (pipe_writer, pipe_reader) = tokio::io::duplex(SSE_PIPE_CAPACITY);
    let writer = Arc::new(SseWriter::new(pipe_writer));

    let request_cancel = session.cancellation().child_token();
    let disconnect_guard = request_cancel.clone().drop_guard();

    let transport = session.transport().clone();
    let session_id = session.id().to_string();
    tokio::spawn(async move {
        let produced = produce(transport, writer.clone(), request_cancel).await;
        match produced {
            Ok(()) => {}
            Err(e) if e.is_closed() => debug!(session_id = %session_id, "Stream closed"),
            Err(e) => warn!(session_id = %session_id, "Stream failed: {}", e),
        }
        if let Err(e) = writer.dispose().await {
            debug!(session_id = %session_id, "Stream ended early: {}", e);
        }
    });

    let stream = ReaderStream::new(pipe_reader).map(move |chunk| {
        let _ = &disconnect_guard;
        chunk
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream".to_string()),
            (header::CACHE_CONTROL, "no-cache, no-store".to_string()),
            (header::CONNECTION, "keep-alive".to_string()),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
            (header::ACCESS_CONTROL_EXPOSE_HEADERS, "Mcp-Session-Id".to_string()),
            (MCP_SESSION_ID, session.id().to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Root handler - provides API info.
async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": "MCP Host Server",
        "version": env!("CARGO_PKG_VERSION"),
        "transport": "Streamable HTTP",
        "endpoints": {
            "mcp": state.config.rpc_path,
            "health": "/health"
        },
        "protocol": "JSON-RPC 2.0 over SSE",
        "sessions": state.sessions.len()
    }))
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "Not found")
}
