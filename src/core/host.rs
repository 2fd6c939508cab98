//! Host lifecycle: one embedded MCP server per host process.
//!
//! [`McpHost::start`] builds the tool registry, loads plugins, binds the
//! listener and spawns the HTTP server. [`McpHost::stop`] tears all of it down
//! again in reverse order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::Config;
use super::error::{Error, Result};
use super::transport::{AppState, HttpTransport, SessionManager, TransportResult};
use crate::domains::tools::{ExecutorFns, PluginEntry, RegistryExecutor, ToolExecutor, ToolRegistry};

/// How long `stop` waits for open connections to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running MCP host.
pub struct McpHost {
    config: Arc<Config>,
    registry: Arc<ToolRegistry>,
    state: AppState,
    local_addr: SocketAddr,
    server: Mutex<Option<JoinHandle<TransportResult<()>>>>,
    stopped: AtomicBool,
}

impl McpHost {
    /// Start a host serving the tools found in the configured plugin directory.
    ///
    /// The server scope is a child of `cancellation`.
    pub async fn start(config: Config, cancellation: CancellationToken) -> Result<Self> {
        Self::start_with(config, Vec::new(), cancellation).await
    }

    /// Like [`McpHost::start`], also registering in-process plugin `entries`.
    pub async fn start_with(
        config: Config,
        entries: Vec<PluginEntry>,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        if let Some(dir) = &config.logging.directory {
            tokio::fs::create_dir_all(dir).await?;
        }

        let registry = Arc::new(ToolRegistry::new(config.plugins.isolation_options()));
        for entry in entries {
            registry.register_entry(entry).await;
        }
        if let Some(dir) = &config.plugins.directory {
            if let Err(e) = registry.load_plugins(dir).await {
                warn!("Plugins in {} not loaded: {}", dir.display(), e);
            }
        }
        info!("{} tool(s) available", registry.tool_count().await);

        let transport = HttpTransport::new(config.transport.clone());
        let listener = match transport.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                registry.unload_plugins().await;
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;

        let adapter: Arc<dyn ToolExecutor> = Arc::new(RegistryExecutor::new(registry.clone()));
        let executor: Arc<dyn ToolExecutor> = Arc::new(ExecutorFns::from_executor(adapter));

        let config = Arc::new(config);
        let cancel = cancellation.child_token();
        let state = AppState::new(config.clone(), executor, cancel.clone());
        let server = tokio::spawn(transport.run(listener, state.clone(), cancel));

        info!(
            "Started {} v{} on {}",
            config.server.name, config.server.version, local_addr
        );

        Ok(Self {
            config,
            registry,
            state,
            local_addr,
            server: Mutex::new(Some(server)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Full URL of the MCP endpoint.
    pub fn endpoint_url(&self) -> String {
        format!("http://{}{}", self.local_addr, self.config.transport.rpc_path)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.state.sessions
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Stop accepting, close every session, release the listener and unload
    /// plugins. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Stopping MCP host");

        self.state.cancel.cancel();
        self.state.sessions.shutdown().await;

        let served = match self.server.lock().await.take() {
            Some(mut handle) => match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(result)) => result.map_err(Error::from),
                Ok(Err(e)) if e.is_cancelled() => Ok(()),
                Ok(Err(e)) => Err(Error::internal(format!("server task failed: {e}"))),
                Err(_) => {
                    warn!("Connections still open after {:?}, aborting", SHUTDOWN_TIMEOUT);
                    handle.abort();
                    Ok(())
                }
            },
            None => Ok(()),
        };

        self.registry.unload_plugins().await;
        info!("MCP host stopped");
        served
    }
}
