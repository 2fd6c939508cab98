//! Transport layer for the MCP server.
//!
//! Streamable HTTP only:
//! - [`http`]: axum router for `POST`/`GET`/`DELETE` on the MCP endpoint
//! - [`session`]: session table, one protocol runtime per session
//! - [`streamable`]: per-session queues between HTTP requests and the runtime
//! - [`sse`]: event framing and the serialized SSE writer
//! - [`message`]: JSON-RPC envelopes

mod config;
mod error;
pub mod http;
pub mod message;
pub mod session;
pub mod sse;
pub mod streamable;

pub use config::HttpConfig;
pub use error::{TransportError, TransportResult};
pub use http::{AppState, HttpTransport};
pub use session::{Session, SessionManager};
pub use streamable::{StreamableTransport, TransportState};
