//! Source access for the module loader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where module sources come from.
pub trait FileReader {
    /// Contents of the file at `path`, or `None` if there is no such file.
    fn read(&self, path: &Path) -> Option<String>;

    /// Whether a readable file exists at `path`.
    fn exists(&self, path: &Path) -> bool {
        self.read(path).is_some()
    }
}

/// Reads from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsReader;

impl FileReader for FsReader {
    fn read(&self, path: &Path) -> Option<String> {
        match std::fs::read_to_string(path) {
            Ok(source) => Some(source),
            Err(err) => {
                tracing::trace!("read {} failed: {}", path.display(), err);
                None
            }
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// In-memory file tree, used for embedded sources and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryReader {
    files: HashMap<PathBuf, String>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        self.insert(path, source);
        self
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, source: impl Into<String>) {
        self.files.insert(path.into(), source.into());
    }
}

impl FileReader for MemoryReader {
    fn read(&self, path: &Path) -> Option<String> {
        self.files.get(path).cloned()
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }
}

impl<F> FileReader for F
where
    F: Fn(&Path) -> Option<String>,
{
    fn read(&self, path: &Path) -> Option<String> {
        self(path)
    }
}
