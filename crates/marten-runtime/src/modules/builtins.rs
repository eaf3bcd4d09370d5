//! Built-in module table

use crate::config::PackageAlias;
use std::collections::HashMap;

/// Names reserved for built-in modules. Requiring one that the host has not
/// installed is an error instead of a filesystem lookup.
pub const NODE_BUILTINS: &[&str] = &[
    "assert",
    "buffer",
    "child_process",
    "crypto",
    "dgram",
    "dns",
    "events",
    "fs",
    "http",
    "https",
    "net",
    "os",
    "path",
    "process",
    "querystring",
    "stream",
    "string_decoder",
    "timers",
    "tls",
    "url",
    "util",
    "zlib",
];

/// Strip the `node:` scheme from a built-in specifier.
pub fn normalize_builtin(name: &str) -> &str {
    name.strip_prefix("node:").unwrap_or(name)
}

pub fn is_reserved(name: &str) -> bool {
    NODE_BUILTINS.contains(&normalize_builtin(name))
}

/// What a built-in name resolves to.
#[derive(Debug, Clone)]
pub enum BuiltinEntry<V> {
    /// Host-provided exports object
    Object(V),
    /// Package resolved from the runtime root's module directories
    Package { name: String, main: Option<String> },
}

#[derive(Debug)]
pub struct BuiltinTable<V> {
    entries: HashMap<String, BuiltinEntry<V>>,
}

impl<V> Default for BuiltinTable<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V: Clone> BuiltinTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_aliases(aliases: &HashMap<String, PackageAlias>) -> Self {
        let mut table = Self::new();
        for (name, alias) in aliases {
            let (package, main) = match alias {
                PackageAlias::Name(package) => (package.clone(), None),
                PackageAlias::Entry { name, main } => (name.clone(), main.clone()),
            };
            table.insert(name, BuiltinEntry::Package { name: package, main });
        }
        table
    }

    pub fn insert(&mut self, name: &str, entry: BuiltinEntry<V>) {
        self.entries.insert(normalize_builtin(name).to_string(), entry);
    }

    pub fn get(&self, name: &str) -> Option<BuiltinEntry<V>> {
        self.entries.get(normalize_builtin(name)).cloned()
    }

    /// Whether `name` is handled as a built-in (installed or reserved).
    pub fn claims(&self, name: &str) -> bool {
        self.entries.contains_key(normalize_builtin(name)) || (name.starts_with("node:") || is_reserved(name))
    }
}
