//! Session table and session lifecycle.
//!
//! A session pairs one [`StreamableTransport`] with the protocol runtime task
//! that serves it. The id → session map is the single source of truth: a
//! session is live exactly while it is in the table.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::streamable::StreamableTransport;
use super::{TransportError, TransportResult};
use crate::core::config::Config;
use crate::core::server::McpServer;
use crate::domains::tools::ToolExecutor;

/// How long a closing session waits for its runtime before aborting it.
const RUNTIME_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// One client session.
pub struct Session {
    id: String,
    transport: Arc<StreamableTransport>,
    cancel: CancellationToken,
    runtime: Mutex<Option<JoinHandle<()>>>,
    created_at: DateTime<Utc>,
}

impl Session {
    /// Session id as sent in the `Mcp-Session-Id` header.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transport owned by this session.
    pub fn transport(&self) -> &Arc<StreamableTransport> {
        &self.transport
    }

    /// Cancellation scope of this session; request scopes are its children.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// When the session was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Tear the session down: cancel its scope, dispose the transport, then
    /// wait for the runtime, aborting it after a grace period.
    ///
    /// Every step tolerates having already happened.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.transport.dispose().await;

        let Some(mut runtime) = self.runtime.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(RUNTIME_GRACE_PERIOD, &mut runtime).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => warn!(session_id = %self.id, "Session runtime failed: {}", e),
            Err(_) => {
                warn!(session_id = %self.id, "Session runtime did not stop in time, aborting");
                runtime.abort();
            }
        }
        debug!(session_id = %self.id, "Session closed");
    }
}

/// Owns every live session.
pub struct SessionManager {
    config: Arc<Config>,
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionManager {
    /// Create an empty session table.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    /// A fresh session id: 128 random bits, base64url without padding.
    pub fn generate_session_id() -> String {
        let bytes: [u8; 16] = rand::random();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Create a session and start its runtime.
    ///
    /// The session scope is a child of `cancellation`. Fails with
    /// [`TransportError::SessionExists`] if `id` is already live; an existing
    /// session is never replaced. Fails with [`TransportError::Closed`] once
    /// `cancellation` has fired.
    pub fn create_session(
        &self,
        id: &str,
        executor: Arc<dyn ToolExecutor>,
        cancellation: &CancellationToken,
    ) -> TransportResult<Arc<Session>> {
        let entry = match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => return Err(TransportError::SessionExists(id.to_string())),
            Entry::Vacant(entry) => entry,
        };
        // Checked under the entry lock, so `shutdown` either sees this
        // session or the insert never happens.
        if cancellation.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let transport = Arc::new(StreamableTransport::new(
            id,
            self.config.transport.incoming_queue_capacity,
            self.config.transport.keep_alive(),
        ));
        let cancel = cancellation.child_token();

        let server = McpServer::new(self.config.clone(), executor);
        let runtime = tokio::spawn(server.run(transport.clone(), cancel.clone()));

        let session = Arc::new(Session {
            id: id.to_string(),
            transport,
            cancel,
            runtime: Mutex::new(Some(runtime)),
            created_at: Utc::now(),
        });
        entry.insert(session.clone());

        info!(session_id = %id, "Session created");
        Ok(session)
    }

    /// Look up a live session.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove and close a session. Returns `false` if it was not live.
    pub async fn remove_session(&self, id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };

        session.close().await;
        info!(session_id = %id, "Session removed");
        true
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all live sessions.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close every live session.
    pub async fn shutdown(&self) {
        let ids = self.session_ids();
        if !ids.is_empty() {
            info!("Closing {} session(s)", ids.len());
        }
        for id in ids {
            self.remove_session(&id).await;
        }
    }
}
