//! Plugin package naming and dependency manifests.
//!
//! A plugin package is a primary module named `<name>.mcp-plugin`, optionally
//! accompanied by `<name>.deps.json` in the same directory:
//!
//! ```json
//! {
//!   "interpreter": "sh",
//!   "dependencies": [
//!     { "name": "shared", "version": "2.0.0", "path": "libs/shared-2.0.0" }
//!   ],
//!   "nativeLibraries": [
//!     { "name": "geom", "path": "native" }
//!   ]
//! }
//! ```
//!
//! Relative paths are resolved against the module's directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{IsolationError, IsolationResult};

/// File suffix of primary plugin modules.
pub const PLUGIN_SUFFIX: &str = ".mcp-plugin";

/// File suffix of dependency manifests.
pub const MANIFEST_SUFFIX: &str = ".deps.json";

/// One dependency entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Dependency name, used for directory and host lookups.
    pub name: String,

    /// Version the plugin was built against; informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Exact location of the dependency, relative to the module directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Dependency manifest of one plugin package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Program that runs the module; the module is executed directly when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    /// Extra arguments passed to the module.
    #[serde(default)]
    pub args: Vec<String>,

    /// Managed dependencies.
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    /// Native libraries, exposed through the library search path.
    #[serde(default)]
    pub native_libraries: Vec<DependencySpec>,
}

impl PluginManifest {
    /// Manifest path belonging to `module`.
    pub fn path_for(module: &Path) -> PathBuf {
        let name = plugin_name(module).unwrap_or_default();
        module.with_file_name(format!("{name}{MANIFEST_SUFFIX}"))
    }

    /// Load the manifest next to `module`; a missing manifest is empty.
    pub fn load_for(module: &Path) -> IsolationResult<Self> {
        let path = Self::path_for(module);
        if !path.is_file() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text).map_err(|e| IsolationError::manifest(&path, e.to_string()))
    }
}

/// Whether the file name marks a primary plugin module (suffix after a
/// non-empty stem).
pub fn has_plugin_suffix(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.len() > PLUGIN_SUFFIX.len() && name.ends_with(PLUGIN_SUFFIX))
}

/// Plugin name: the module file name without its suffix.
pub fn plugin_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(PLUGIN_SUFFIX))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plugin_name() {
        assert_eq!(
            plugin_name(Path::new("/p/geometry.mcp-plugin")).as_deref(),
            Some("geometry")
        );
        assert!(plugin_name(Path::new("/p/.mcp-plugin")).is_none());
        assert!(plugin_name(Path::new("/p/geometry.dll")).is_none());
    }

    #[test]
    fn test_plugin_suffix() {
        assert!(has_plugin_suffix(Path::new("/p/a.mcp-plugin")));
        assert!(!has_plugin_suffix(Path::new("/p/a.deps.json")));
        assert!(!has_plugin_suffix(Path::new("/p/.mcp-plugin")));
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        let manifest = PluginManifest::load_for(&dir.path().join("x.mcp-plugin")).unwrap();
        assert_eq!(manifest, PluginManifest::default());
    }

    #[test]
    fn test_load_manifest() {
        let dir = TempDir::new().unwrap();
        let module = dir.path().join("x.mcp-plugin");
        std::fs::write(
            dir.path().join("x.deps.json"),
            r#"{
                "interpreter": "sh",
                "dependencies": [{"name": "shared", "version": "1.0", "path": "deps/shared"}],
                "nativeLibraries": [{"name": "geom"}]
            }"#,
        )
        .unwrap();

        let manifest = PluginManifest::load_for(&module).unwrap();
        assert_eq!(manifest.interpreter.as_deref(), Some("sh"));
        assert_eq!(manifest.dependencies[0].name, "shared");
        assert_eq!(
            manifest.dependencies[0].path.as_deref(),
            Some(Path::new("deps/shared"))
        );
        assert_eq!(manifest.native_libraries[0].name, "geom");
    }

    #[test]
    fn test_malformed_manifest() {
        let dir = TempDir::new().unwrap();
        let module = dir.path().join("bad.mcp-plugin");
        std::fs::write(dir.path().join("bad.deps.json"), "{not json").unwrap();

        let result = PluginManifest::load_for(&module);
        assert!(matches!(result, Err(IsolationError::Manifest { .. })));
    }
}
