//! Dependency resolution for isolation contexts.
//!
//! Each dependency resolves in this order:
//!
//! 1. names on the host-shared allow-list: the host's own copy, always
//! 2. the exact path given by the manifest
//! 3. an entry with the same name in the module's directory
//! 4. the host library directory
//!
//! Native libraries follow the same order and end up as directories on the
//! plugin process's library search path.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::manifest::{DependencySpec, PluginManifest};
use super::{IsolationError, IsolationResult};

/// Library search path variable of the current platform.
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(windows)]
pub const LIBRARY_PATH_VAR: &str = "PATH";
#[cfg(not(any(target_os = "macos", windows)))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Where a dependency was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// Allow-listed name forced to the host's copy.
    HostShared,
    /// Exact path from the manifest.
    Manifest,
    /// Same-name entry next to the module.
    Directory,
    /// Host library directory fallback.
    Host,
}

/// A dependency with a concrete location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub name: String,
    pub path: PathBuf,
    pub source: ResolutionSource,
}

impl ResolvedDependency {
    /// Environment variable through which the plugin finds this dependency.
    pub fn env_var(&self) -> String {
        dependency_env_var(&self.name)
    }
}

/// Outcome of resolving a whole manifest.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub dependencies: Vec<ResolvedDependency>,
    pub native_dirs: Vec<PathBuf>,
    pub unresolved: Vec<String>,
}

/// Resolves the dependencies of modules in one directory.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    module_dir: PathBuf,
    host_library_dir: Option<PathBuf>,
    host_shared: HashSet<String>,
}

impl DependencyResolver {
    /// Create a resolver for modules in `module_dir`.
    pub fn new(
        module_dir: impl Into<PathBuf>,
        host_library_dir: Option<PathBuf>,
        host_shared: &[String],
    ) -> Self {
        Self {
            module_dir: module_dir.into(),
            host_library_dir,
            host_shared: host_shared.iter().map(|name| name.to_lowercase()).collect(),
        }
    }

    /// Whether `name` must always come from the host.
    pub fn is_host_shared(&self, name: &str) -> bool {
        self.host_shared.contains(&name.to_lowercase())
    }

    /// Resolve one dependency; `None` when nothing matches.
    pub fn resolve(&self, spec: &DependencySpec) -> Option<ResolvedDependency> {
        let found = |path: PathBuf, source| {
            path.exists().then(|| ResolvedDependency {
                name: spec.name.clone(),
                path,
                source,
            })
        };

        if self.is_host_shared(&spec.name) {
            // A plugin-private copy is never acceptable here.
            return self
                .host_library_dir
                .as_ref()
                .and_then(|dir| found(dir.join(&spec.name), ResolutionSource::HostShared));
        }

        spec.path
            .as_ref()
            .and_then(|path| found(self.module_dir.join(path), ResolutionSource::Manifest))
            .or_else(|| found(self.module_dir.join(&spec.name), ResolutionSource::Directory))
            .or_else(|| {
                self.host_library_dir
                    .as_ref()
                    .and_then(|dir| found(dir.join(&spec.name), ResolutionSource::Host))
            })
    }

    /// Resolve every entry of `manifest`, skipping what cannot be found.
    pub fn resolve_manifest(&self, manifest: &PluginManifest) -> Resolution {
        let mut resolution = Resolution::default();

        for spec in &manifest.dependencies {
            match self.resolve(spec) {
                Some(resolved) => {
                    debug!(
                        "Resolved dependency {} via {:?}: {}",
                        resolved.name,
                        resolved.source,
                        resolved.path.display()
                    );
                    resolution.dependencies.push(resolved);
                }
                None => {
                    warn!("Unresolved dependency {}, skipping", spec.name);
                    resolution.unresolved.push(spec.name.clone());
                }
            }
        }

        for spec in &manifest.native_libraries {
            match self.resolve(spec) {
                Some(resolved) => {
                    let dir = if resolved.path.is_dir() {
                        resolved.path
                    } else {
                        match resolved.path.parent() {
                            Some(parent) => parent.to_path_buf(),
                            None => continue,
                        }
                    };
                    if !resolution.native_dirs.contains(&dir) {
                        resolution.native_dirs.push(dir);
                    }
                }
                None => {
                    warn!("Unresolved native library {}, skipping", spec.name);
                    resolution.unresolved.push(spec.name.clone());
                }
            }
        }

        resolution
    }

    /// Library search path for the plugin process: native library
    /// directories, then the module directory, then the host directory, then
    /// whatever the host process already had.
    pub fn library_search_path(&self, native_dirs: &[PathBuf]) -> IsolationResult<OsString> {
        let mut dirs: Vec<PathBuf> = native_dirs.to_vec();
        dirs.push(self.module_dir.clone());
        if let Some(host) = &self.host_library_dir {
            dirs.push(host.clone());
        }
        if let Some(existing) = std::env::var_os(LIBRARY_PATH_VAR) {
            dirs.extend(std::env::split_paths(&existing));
        }

        std::env::join_paths(dirs)
            .map_err(|e| IsolationError::protocol(format!("invalid library search path: {e}")))
    }

    /// Directory of the modules this resolver serves.
    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }
}

/// `MCP_DEP_<NAME>` with every non-alphanumeric character replaced by `_`.
pub fn dependency_env_var(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MCP_DEP_{suffix}")
}
