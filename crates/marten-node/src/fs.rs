//! node:fs implementation
//!
//! File status queries: `statSync`, `stat`, `existsSync` and the access
//! `constants`.

use crate::context::NodeContext;
use crate::options;
use marten_runtime::{ArgParser, Guest, GuestResult, GuestValue, RuntimeError, ValueKind};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// File system error.
#[derive(Debug)]
pub enum FsError {
    Io { syscall: &'static str, path: String, source: io::Error },
    InvalidPath(String),
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsError::Io { syscall, path, source } => write!(f, "{}, {} '{}'", source, syscall, path),
            FsError::InvalidPath(kind) => write!(f, "The \"path\" argument must be a string, got {}", kind),
        }
    }
}

impl std::error::Error for FsError {}

impl FsError {
    fn stat(path: &str, source: io::Error) -> Self {
        FsError::Io {
            syscall: "stat",
            path: path.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

impl From<FsError> for RuntimeError {
    fn from(err: FsError) -> Self {
        match &err {
            FsError::Io { source, .. } => RuntimeError::Io(io::Error::new(source.kind(), err.to_string())),
            FsError::InvalidPath(kind) => RuntimeError::type_error("path string", kind.clone()),
        }
    }
}

/// File statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    #[serde(skip)]
    pub is_file: bool,
    #[serde(skip)]
    pub is_directory: bool,
    #[serde(skip)]
    pub is_symlink: bool,
    pub size: u64,
    pub mode: u32,
    pub mtime_ms: u64,
    pub atime_ms: u64,
    pub ctime_ms: u64,
    pub birthtime_ms: u64,
}

fn millis(time: io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl From<&Metadata> for Stats {
    fn from(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();

        #[cfg(unix)]
        let (mode, ctime_ms) = {
            use std::os::unix::fs::MetadataExt;
            let ctime = metadata.ctime().max(0) as u64 * 1000 + (metadata.ctime_nsec().max(0) as u64) / 1_000_000;
            (metadata.mode(), ctime)
        };
        #[cfg(not(unix))]
        let (mode, ctime_ms) = (0u32, millis(metadata.modified()));

        Stats {
            is_file: file_type.is_file(),
            is_directory: file_type.is_dir(),
            is_symlink: file_type.is_symlink(),
            size: metadata.len(),
            mode,
            mtime_ms: millis(metadata.modified()),
            atime_ms: millis(metadata.accessed()),
            ctime_ms,
            birthtime_ms: millis(metadata.created()),
        }
    }
}

/// Stat `path` on the calling thread.
pub fn stat_sync(path: &str) -> Result<Stats, FsError> {
    let metadata = std::fs::metadata(path).map_err(|e| FsError::stat(path, e))?;
    Ok(Stats::from(&metadata))
}

/// Stat `path` without blocking the loop.
pub async fn stat(path: &str) -> Result<Stats, FsError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| FsError::stat(path, e))?;
    Ok(Stats::from(&metadata))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatOptions {
    #[serde(default = "yes")]
    throw_if_no_entry: bool,
}

fn yes() -> bool {
    true
}

impl Default for StatOptions {
    fn default() -> Self {
        Self { throw_if_no_entry: true }
    }
}

/// Guest `Stats` object: the numeric fields plus `isFile()`,
/// `isDirectory()` and `isSymbolicLink()`.
fn stats_object<G: Guest>(guest: &G, stats: &Stats) -> GuestResult<G::Value, G::Value> {
    let json = serde_json::to_value(stats).map_err(|e| RuntimeError::internal(e.to_string()))?;
    let object = guest.from_json(&json);
    for (name, answer) in [
        ("isFile", stats.is_file),
        ("isDirectory", stats.is_directory),
        ("isSymbolicLink", stats.is_symlink),
    ] {
        guest.set_function(&object, name, move |guest, _this, _args| Ok(guest.boolean(answer)))?;
    }
    Ok(object)
}

fn path_arg<G: Guest>(guest: &G, value: Option<&G::Value>) -> Result<String, FsError> {
    let kind = value.map_or("undefined", |v| v.kind().name());
    match value {
        Some(v) if v.kind() == ValueKind::String || v.kind() == ValueKind::Bytes => {
            guest.as_string(v).ok_or_else(|| FsError::InvalidPath(kind.to_string()))
        }
        _ => Err(FsError::InvalidPath(kind.to_string())),
    }
}

/// Exports of `require('fs')`.
pub fn module<G: Guest>(ctx: &Rc<NodeContext<G>>, guest: &G) -> GuestResult<G::Value, G::Value> {
    let exports = guest.object();

    guest.set_function(&exports, "statSync", |guest, _this, args| {
        let path = path_arg(guest, args.first()).map_err(RuntimeError::from)?;
        let options = match args.get(1) {
            Some(value) => options::parse::<G, StatOptions>(guest, value, "statSync")?,
            None => StatOptions::default(),
        };
        match stat_sync(&path) {
            Ok(stats) => stats_object(guest, &stats),
            Err(err) if err.is_not_found() && !options.throw_if_no_entry => Ok(guest.undefined()),
            Err(err) => Err(RuntimeError::from(err).into()),
        }
    })?;

    let context = ctx.clone();
    guest.set_function(&exports, "stat", move |guest, _this, args| {
        let path = path_arg(guest, args.first()).map_err(RuntimeError::from)?;
        let callback = ArgParser::new(args.get(1..).unwrap_or_default())
            .trailing_function()
            .cloned()
            .ok_or_else(|| RuntimeError::type_error("callback function", "undefined"))?;
        let ctx = context.clone();
        context.host().spawn(async move {
            let result = stat(&path).await;
            let Ok(guest) = ctx.guest() else { return };
            let args = match result.map_err(RuntimeError::from) {
                Ok(stats) => match stats_object(guest.as_ref(), &stats) {
                    Ok(object) => vec![guest.null(), object],
                    Err(err) => vec![guest.throwable(err)],
                },
                Err(err) => vec![guest.runtime_error(&err)],
            };
            ctx.invoke(guest.as_ref(), &callback, &args);
        });
        Ok(guest.undefined())
    })?;

    guest.set_function(&exports, "existsSync", |guest, _this, args| {
        let exists = match path_arg(guest, args.first()) {
            Ok(path) => Path::new(&path).try_exists().unwrap_or(false),
            Err(_) => false,
        };
        Ok(guest.boolean(exists))
    })?;

    let constants = guest.object();
    for (name, value) in [("F_OK", 0.0), ("R_OK", 4.0), ("W_OK", 2.0), ("X_OK", 1.0)] {
        guest.set(&constants, name, guest.number(value))?;
    }
    guest.set(&exports, "constants", constants)?;

    Ok(exports)
}
