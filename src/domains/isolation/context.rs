//! Isolation contexts: one plugin package, one process.
//!
//! Loading a context shadow-copies the primary module into a private
//! temporary directory, resolves its dependencies and starts the copy as a
//! child process. The child sees its own dependency set only, so two plugins
//! built against different versions of the same library never observe each
//! other's copy, and neither touches the host's.
//!
//! Only text crosses the boundary (see [`super::protocol`]).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::manifest::{PluginManifest, plugin_name};
use super::protocol::PluginRequest;
use super::resolver::{DependencyResolver, LIBRARY_PATH_VAR, ResolvedDependency};
use super::{IsolationError, IsolationResult};

/// "Text file busy": the freshly written shadow copy is still open for
/// writing somewhere (typically a concurrent fork).
#[cfg(unix)]
const ETXTBSY: i32 = 26;

const SPAWN_ATTEMPTS: u32 = 5;

/// Settings shared by every context.
#[derive(Debug, Clone)]
pub struct IsolationOptions {
    /// Directory holding the host's own copies of shared libraries.
    pub host_library_dir: Option<PathBuf>,

    /// Dependency names that always resolve to the host's copy.
    pub host_shared_dependencies: Vec<String>,

    /// Timeout for one request/answer exchange.
    pub request_timeout: Duration,

    /// Grace period for the process to exit on unload.
    pub unload_timeout: Duration,
}

impl Default for IsolationOptions {
    fn default() -> Self {
        Self {
            host_library_dir: None,
            host_shared_dependencies: crate::core::config::DEFAULT_HOST_SHARED_DEPENDENCIES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            request_timeout: Duration::from_secs(120),
            unload_timeout: Duration::from_secs(2),
        }
    }
}

struct PluginProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

struct Loaded {
    process: Option<PluginProcess>,
    shadow: TempDir,
}

/// An independently unloadable plugin scope.
pub struct IsolationContext {
    name: String,
    shadow_path: PathBuf,
    dependencies: Vec<ResolvedDependency>,
    request_timeout: Duration,
    unload_timeout: Duration,
    unloaded: AtomicBool,
    state: Mutex<Option<Loaded>>,
}

impl IsolationContext {
    /// Load `module_path` into a fresh context.
    #[instrument(skip(options), fields(module = %module_path.display()))]
    pub async fn load(module_path: &Path, options: &IsolationOptions) -> IsolationResult<Self> {
        if !module_path.is_file() {
            return Err(IsolationError::ModuleNotFound(module_path.to_path_buf()));
        }
        let name = plugin_name(module_path)
            .ok_or_else(|| IsolationError::ModuleNotFound(module_path.to_path_buf()))?;
        let module_dir = match module_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let module_dir = tokio::fs::canonicalize(module_dir).await?;

        let manifest = PluginManifest::load_for(module_path)?;

        // Copy the bytes so the original file is never held open.
        let bytes = tokio::fs::read(module_path).await?;
        let shadow = tempfile::Builder::new()
            .prefix(&format!("mcp-plugin-{name}-"))
            .tempdir()?;
        let shadow_path = shadow.path().join(
            module_path
                .file_name()
                .ok_or_else(|| IsolationError::ModuleNotFound(module_path.to_path_buf()))?,
        );
        write_shadow(&shadow_path, &bytes, manifest.interpreter.is_none()).await?;

        let resolver = DependencyResolver::new(
            &module_dir,
            options.host_library_dir.clone(),
            &options.host_shared_dependencies,
        );
        let resolution = resolver.resolve_manifest(&manifest);

        let mut command = match &manifest.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&shadow_path);
                command
            }
            None => Command::new(&shadow_path),
        };
        command
            .args(&manifest.args)
            .current_dir(&module_dir)
            .env("MCP_PLUGIN_NAME", &name)
            .env("MCP_PLUGIN_DIR", &module_dir)
            .env(
                LIBRARY_PATH_VAR,
                resolver.library_search_path(&resolution.native_dirs)?,
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for dependency in &resolution.dependencies {
            command.env(dependency.env_var(), &dependency.path);
        }

        let mut child = spawn_with_retry(&mut command, &name).await?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IsolationError::protocol("plugin stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IsolationError::protocol("plugin stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            let plugin = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(plugin = %plugin, "{}", line);
                }
            });
        }

        info!(
            "Loaded plugin {} ({} dependencies, {} unresolved)",
            name,
            resolution.dependencies.len(),
            resolution.unresolved.len()
        );

        Ok(Self {
            name,
            shadow_path,
            dependencies: resolution.dependencies,
            request_timeout: options.request_timeout,
            unload_timeout: options.unload_timeout,
            unloaded: AtomicBool::new(false),
            state: Mutex::new(Some(Loaded {
                process: Some(PluginProcess {
                    child,
                    stdin,
                    stdout: BufReader::new(stdout).lines(),
                }),
                shadow,
            })),
        })
    }

    /// Context name (the plugin name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of the shadow copy the process runs from.
    pub fn shadow_path(&self) -> &Path {
        &self.shadow_path
    }

    /// Dependencies resolved for this context.
    pub fn dependencies(&self) -> &[ResolvedDependency] {
        &self.dependencies
    }

    /// Whether [`unload`](Self::unload) has been called.
    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Ask the plugin for its tool list (JSON array text).
    pub async fn list_tools(&self) -> IsolationResult<String> {
        self.request(&PluginRequest::ListTools).await
    }

    /// Run one tool inside the plugin (JSON result text).
    pub async fn execute_tool(&self, name: &str, arguments_json: &str) -> IsolationResult<String> {
        let request = PluginRequest::execute(name, arguments_json)?;
        self.request(&request).await
    }

    async fn request(&self, request: &PluginRequest) -> IsolationResult<String> {
        if self.is_unloaded() {
            return Err(IsolationError::Unloaded(self.name.clone()));
        }

        // One exchange at a time per context.
        let mut state = self.state.lock().await;
        let Some(loaded) = state.as_mut() else {
            return Err(IsolationError::Unloaded(self.name.clone()));
        };
        let Some(process) = loaded.process.as_mut() else {
            return Err(IsolationError::Exited(self.name.clone()));
        };

        let exchange = async {
            let mut line = request.encode();
            line.push('\n');
            process.stdin.write_all(line.as_bytes()).await?;
            process.stdin.flush().await?;
            process.stdout.next_line().await
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => {
                warn!("Plugin {} closed its output", self.name);
                loaded.process = None;
                Err(IsolationError::Exited(self.name.clone()))
            }
            Ok(Err(e)) => {
                warn!("Plugin {} pipe failed: {}", self.name, e);
                loaded.process = None;
                Err(IsolationError::Exited(self.name.clone()))
            }
            Err(_) => {
                // A late answer would be read as the reply to the next request.
                warn!("Plugin {} timed out, stopping it", self.name);
                if let Some(mut process) = loaded.process.take() {
                    let _ = process.child.start_kill();
                }
                Err(IsolationError::Timeout(self.request_timeout))
            }
        }
    }

    /// Stop the plugin process and delete the shadow copy.
    ///
    /// Afterwards every call fails with [`IsolationError::Unloaded`]. Calling
    /// it again is a no-op.
    pub async fn unload(&self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return;
        }

        let Some(loaded) = self.state.lock().await.take() else {
            return;
        };

        if let Some(mut process) = loaded.process {
            let mut line = PluginRequest::Shutdown.encode();
            line.push('\n');
            let _ = process.stdin.write_all(line.as_bytes()).await;
            let _ = process.stdin.flush().await;
            drop(process.stdin);

            match tokio::time::timeout(self.unload_timeout, process.child.wait()).await {
                Ok(Ok(status)) => debug!("Plugin {} exited with {}", self.name, status),
                Ok(Err(e)) => warn!("Failed to wait for plugin {}: {}", self.name, e),
                Err(_) => {
                    warn!("Plugin {} ignored shutdown, killing it", self.name);
                    let _ = process.child.kill().await;
                }
            }
        }

        if let Err(e) = loaded.shadow.close() {
            warn!("Failed to remove shadow copy of {}: {}", self.name, e);
        }
        info!("Unloaded plugin {}", self.name);
    }
}

async fn write_shadow(path: &Path, bytes: &[u8], executable: bool) -> IsolationResult<()> {
    tokio::fs::write(path, bytes).await?;
    if executable {
        mark_executable(path).await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn mark_executable(path: &Path) -> IsolationResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Path) -> IsolationResult<()> {
    Ok(())
}

async fn spawn_with_retry(command: &mut Command, name: &str) -> IsolationResult<Child> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match command.spawn() {
            Ok(child) => return Ok(child),
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                debug!("Shadow copy of {} busy, retrying spawn", name);
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
            }
            Err(e) => return Err(IsolationError::spawn(name, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::isolation::fixtures;
    use tempfile::TempDir;

    fn options() -> IsolationOptions {
        IsolationOptions {
            request_timeout: Duration::from_secs(5),
            unload_timeout: Duration::from_millis(500),
            ..IsolationOptions::default()
        }
    }

    #[tokio::test]
    async fn test_missing_module() {
        let dir = TempDir::new().unwrap();
        let result = IsolationContext::load(&dir.path().join("nope.mcp-plugin"), &options()).await;
        assert!(matches!(result, Err(IsolationError::ModuleNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_list_execute_unload() {
        let dir = TempDir::new().unwrap();
        let module = fixtures::write_echo_plugin(dir.path(), "echo");

        let context = IsolationContext::load(&module, &options()).await.unwrap();
        assert_eq!(context.name(), "echo");
        assert_ne!(context.shadow_path(), module.as_path());
        assert!(context.shadow_path().is_file());

        let tools: serde_json::Value =
            serde_json::from_str(&context.list_tools().await.unwrap()).unwrap();
        assert_eq!(tools[0]["name"], "echo_text");

        let result: serde_json::Value = serde_json::from_str(
            &context
                .execute_tool("echo_text", r#"{"text":"hello"}"#)
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(result["content"][0]["text"], r#"{"text":"hello"}"#);

        let shadow = context.shadow_path().to_path_buf();
        context.unload().await;
        assert!(!shadow.exists());
        assert!(module.exists());

        let after = context.list_tools().await;
        assert!(matches!(after, Err(IsolationError::Unloaded(name)) if name == "echo"));

        // Second unload is a no-op.
        context.unload().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_stops_plugin() {
        let dir = TempDir::new().unwrap();
        let module = fixtures::write_stalling_plugin(dir.path(), "stall");
        let options = IsolationOptions {
            request_timeout: Duration::from_millis(100),
            ..options()
        };

        let context = IsolationContext::load(&module, &options).await.unwrap();
        assert!(context.list_tools().await.is_ok());

        let stalled = context.execute_tool("stall", "{}").await;
        assert!(matches!(stalled, Err(IsolationError::Timeout(t)) if t == Duration::from_millis(100)));

        let after = context.list_tools().await;
        assert!(matches!(after, Err(IsolationError::Exited(name)) if name == "stall"));

        context.unload().await;
        assert!(!context.shadow_path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_dependency_versions() {
        let dir = TempDir::new().unwrap();
        let alpha = fixtures::write_versioned_plugin(dir.path(), "alpha", "1.0.0");
        let beta = fixtures::write_versioned_plugin(dir.path(), "beta", "2.0.0");

        let alpha = IsolationContext::load(&alpha, &options()).await.unwrap();
        let beta = IsolationContext::load(&beta, &options()).await.unwrap();

        let read = |text: String| -> String {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            value["content"][0]["text"].as_str().unwrap().to_string()
        };
        assert_eq!(
            read(alpha.execute_tool("dependency_version", "{}").await.unwrap()),
            "1.0.0"
        );
        assert_eq!(
            read(beta.execute_tool("dependency_version", "{}").await.unwrap()),
            "2.0.0"
        );

        alpha.unload().await;
        beta.unload().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_shared_dependency_comes_from_host() {
        let dir = TempDir::new().unwrap();
        let host = TempDir::new().unwrap();
        std::fs::write(host.path().join("host-geometry"), "host\n").unwrap();
        let module = fixtures::write_host_shared_plugin(dir.path(), "geo");

        let options = IsolationOptions {
            host_library_dir: Some(host.path().to_path_buf()),
            ..options()
        };
        let context = IsolationContext::load(&module, &options).await.unwrap();
        let dependency = &context.dependencies()[0];
        assert_eq!(dependency.path, host.path().join("host-geometry"));

        let text = context.execute_tool("geometry_owner", "{}").await.unwrap();
        assert!(text.contains("\"host\""));
        context.unload().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_arguments_are_rejected_before_sending() {
        let dir = TempDir::new().unwrap();
        let module = fixtures::write_echo_plugin(dir.path(), "strict");
        let context = IsolationContext::load(&module, &options()).await.unwrap();

        let result = context.execute_tool("echo_text", "{oops").await;
        assert!(matches!(result, Err(IsolationError::Protocol(_))));

        // The exchange stays in step afterwards.
        assert!(context.list_tools().await.is_ok());
        context.unload().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_plugin() {
        let dir = TempDir::new().unwrap();
        let module = fixtures::write_script_plugin(dir.path(), "quitter", "exit 0\n");
        let context = IsolationContext::load(&module, &options()).await.unwrap();

        let result = context.list_tools().await;
        assert!(matches!(result, Err(IsolationError::Exited(_))));
        context.unload().await;
    }
}
