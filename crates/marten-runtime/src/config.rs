//! Runtime configuration
//!
//! Loaded from JSON (`marten.json` by convention) or built in code. Every
//! field has a default, so an empty object is a valid config.

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Directory the entry script and built-in packages resolve from.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Module loader settings.
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Buffer size for each native read in a readable pump (default: 16 KiB).
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

/// How module specifiers map onto files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderConfig {
    /// Extension tried after the bare path (default: `js`).
    #[serde(default = "default_script_extension")]
    pub script_extension: String,

    /// Extension parsed as JSON instead of evaluated (default: `json`).
    #[serde(default = "default_data_extension")]
    pub data_extension: String,

    /// Package descriptor file name (default: `package.json`).
    #[serde(default = "default_package_descriptor")]
    pub package_descriptor: String,

    /// Entry used when a package declares no `main` (default: `index.js`).
    #[serde(default = "default_index_file")]
    pub index_file: String,

    /// Directory searched for bare names at every ancestor (default: `node_modules`).
    #[serde(default = "default_modules_dir")]
    pub modules_dir: String,

    /// Built-in names served by installed packages, e.g.
    /// `{"stream": "readable-stream", "buffer": {"name": "buffer", "main": "index.js"}}`.
    #[serde(default)]
    pub builtin_packages: HashMap<String, PackageAlias>,
}

/// Package behind a built-in name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PackageAlias {
    Name(String),
    Entry { name: String, main: Option<String> },
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_read_chunk_size() -> usize {
    16 * 1024
}

fn default_script_extension() -> String {
    "js".to_string()
}

fn default_data_extension() -> String {
    "json".to_string()
}

fn default_package_descriptor() -> String {
    "package.json".to_string()
}

fn default_index_file() -> String {
    "index.js".to_string()
}

fn default_modules_dir() -> String {
    "node_modules".to_string()
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            script_extension: default_script_extension(),
            data_extension: default_data_extension(),
            package_descriptor: default_package_descriptor(),
            index_file: default_index_file(),
            modules_dir: default_modules_dir(),
            builtin_packages: HashMap::new(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            loader: LoaderConfig::default(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl RuntimeConfig {
    /// Config rooted at `root` with defaults elsewhere.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config.
    pub fn from_json_str(source: &str) -> RuntimeResult<Self> {
        let config: Self = serde_json::from_str(source).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file. A relative `root` is taken relative to the file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config = Self::from_json_str(&source)?;
        if config.root.is_relative() {
            if let Some(dir) = path.parent() {
                config.root = dir.join(&config.root);
            }
        }
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn validate(&self) -> RuntimeResult<()> {
        if self.read_chunk_size == 0 {
            return Err(RuntimeError::Config("readChunkSize must be positive".to_string()));
        }
        if self.loader.script_extension.is_empty() || self.loader.script_extension.starts_with('.') {
            return Err(RuntimeError::Config(format!(
                "scriptExtension must be a bare extension, got '{}'",
                self.loader.script_extension
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config.root, PathBuf::from("."));
        assert_eq!(config.loader.script_extension, "js");
        assert_eq!(config.loader.modules_dir, "node_modules");
        assert_eq!(config.read_chunk_size, 16 * 1024);
    }

    #[test]
    fn test_builtin_packages() {
        let config = RuntimeConfig::from_json_str(
            r#"{
                "loader": {
                    "builtinPackages": {
                        "stream": "readable-stream",
                        "buffer": { "name": "buffer", "main": "index.js" }
                    }
                }
            }"#,
        )
        .unwrap();
        let packages = &config.loader.builtin_packages;
        assert_eq!(packages["stream"], PackageAlias::Name("readable-stream".to_string()));
        assert_eq!(
            packages["buffer"],
            PackageAlias::Entry {
                name: "buffer".to_string(),
                main: Some("index.js".to_string())
            }
        );
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let err = RuntimeConfig::from_json_str(r#"{"readChunkSize": 0}"#).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[test]
    fn test_from_file_resolves_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marten.json");
        std::fs::write(&path, r#"{"root": "app"}"#).unwrap();
        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.root, dir.path().join("app"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = RuntimeConfig::load_or_default(Path::new("/definitely/not/here.json"));
        assert_eq!(config.loader.index_file, "index.js");
    }
}
