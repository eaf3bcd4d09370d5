//! Lexical path helpers. No filesystem access, no symlink resolution.

use std::path::{Component, Path, PathBuf};

/// Collapse `.` and `..` components.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Join `name` onto `dir` and normalize. An absolute `name` replaces `dir`.
pub fn join(dir: &Path, name: &str) -> PathBuf {
    normalize(&dir.join(name))
}

/// Append an extension without replacing an existing one (`a.min` -> `a.min.js`).
pub fn with_extension(path: &Path, ext: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".");
    raw.push(ext);
    PathBuf::from(raw)
}

/// Parent directory, or the path itself at the root.
pub fn dirname(path: &Path) -> PathBuf {
    path.parent().map_or_else(|| path.to_path_buf(), Path::to_path_buf)
}

/// Whether `name` is an explicit path rather than a bare module name.
pub fn is_explicit(name: &str) -> bool {
    name.starts_with('/') || name.starts_with('.') || name.starts_with('\\')
}

pub fn to_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
