//! CommonJS module resolution and loading
//!
//! `require(name)` resolves, in order:
//! 1. the module cache, by the raw name
//! 2. the built-in table (cached under the built-in name)
//! 3. starting at the requiring file's directory:
//!    `<dir>/<name>`, `<dir>/<name>.js`, `<dir>/<name>` as a package, and for
//!    bare names `<dir>/node_modules/<name>` as a package. Explicit paths stop
//!    here; bare names repeat the step in each ancestor directory.
//!
//! A script module's record is cached before its body runs, so a circular
//! `require` receives the partially populated `module.exports`.
//!
//! The cache is mirrored into a guest object shared by every bound `require`
//! as `require.cache`. Entries guest code writes there are picked up by later
//! lookups, and an entry set to `undefined` is evicted.

pub mod builtins;
pub mod path;
pub mod reader;
pub mod wrapper;

use crate::config::LoaderConfig;
use crate::error::{GuestError, GuestResult, RuntimeError, RuntimeResult};
use crate::guest::{Guest, GuestValue, ValueKind};
use builtins::{BuiltinEntry, BuiltinTable};
use reader::FileReader;
use serde::Deserialize;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

pub use builtins::{NODE_BUILTINS, normalize_builtin};
pub use reader::{FsReader, MemoryReader};

/// Module lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Body is running; `module.exports` may be partial
    Loading,
    /// Body finished
    Loaded,
}

/// Cached result of loading one module.
#[derive(Debug)]
pub struct ModuleRecord<V> {
    /// Resolved path, or the built-in name
    pub id: String,
    /// The guest `module` object; exports live at `module.exports`
    pub module: V,
    state: Cell<ModuleState>,
}

impl<V> ModuleRecord<V> {
    pub fn state(&self) -> ModuleState {
        self.state.get()
    }
}

/// Where a specifier resolved to, before anything is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Builtin(String),
    File(PathBuf),
    /// Package directory and the entry file inside it
    Package { dir: PathBuf, entry: PathBuf },
}

impl Resolved {
    /// Cache key of the file that gets evaluated.
    pub fn key(&self) -> String {
        match self {
            Resolved::Builtin(name) => name.clone(),
            Resolved::File(path) | Resolved::Package { entry: path, .. } => path::to_key(path),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PackageDescriptor {
    main: Option<String>,
}

/// Resolves and loads modules into a guest context.
pub struct ModuleLoader<G: Guest> {
    guest: Weak<G>,
    reader: Box<dyn FileReader>,
    config: LoaderConfig,
    root: PathBuf,
    builtins: RefCell<BuiltinTable<G::Value>>,
    cache: RefCell<HashMap<String, Rc<ModuleRecord<G::Value>>>>,
    /// Guest view of `cache`, exposed as `require.cache`
    cache_object: G::Value,
    this: Weak<Self>,
}

impl<G: Guest> ModuleLoader<G> {
    pub fn new(guest: &Rc<G>, reader: Box<dyn FileReader>, config: LoaderConfig, root: PathBuf) -> Rc<Self> {
        let builtins = BuiltinTable::from_aliases(&config.builtin_packages);
        Rc::new_cyclic(|this| Self {
            guest: Rc::downgrade(guest),
            reader,
            config,
            root: path::normalize(&root),
            builtins: RefCell::new(builtins),
            cache: RefCell::new(HashMap::new()),
            cache_object: guest.object(),
            this: this.clone(),
        })
    }

    fn guest(&self) -> RuntimeResult<Rc<G>> {
        self.guest
            .upgrade()
            .ok_or_else(|| RuntimeError::internal("guest context has been dropped"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a host object as the exports of built-in `name`.
    pub fn define(&self, name: &str, exports: G::Value) {
        let name = normalize_builtin(name);
        self.builtins
            .borrow_mut()
            .insert(name, BuiltinEntry::Object(exports));
        // A fresh definition replaces whatever was cached under the name.
        self.evict(name);
    }

    /// Current exports of a cached module.
    pub fn get(&self, key: &str) -> Option<G::Value> {
        let guest = self.guest.upgrade()?;
        let record = self.sync_record(guest.as_ref(), key)?;
        guest.get(&record.module, "exports").ok()
    }

    /// The guest object behind `require.cache`.
    pub fn cache_object(&self) -> &G::Value {
        &self.cache_object
    }

    /// Record for `key` after reconciling with what guest code did to
    /// `require.cache[key]`.
    fn sync_record(&self, guest: &G, key: &str) -> Option<Rc<ModuleRecord<G::Value>>> {
        let entry = match guest.get(&self.cache_object, key) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!("reading require.cache[{}] failed: {}", key, guest.describe(err));
                return self.record(key);
            }
        };
        let record = self.record(key);
        if entry.kind() != ValueKind::Object {
            if record.is_some() {
                tracing::debug!("module {} removed from require.cache by guest code", key);
                self.cache.borrow_mut().remove(key);
            }
            return None;
        }
        match record {
            Some(record) if record.module.same(&entry) => Some(record),
            _ => {
                tracing::debug!("adopting require.cache entry {}", key);
                let record = Rc::new(ModuleRecord {
                    id: key.to_string(),
                    module: entry,
                    state: Cell::new(ModuleState::Loaded),
                });
                self.cache.borrow_mut().insert(key.to_string(), record.clone());
                Some(record)
            }
        }
    }

    fn insert_record(&self, key: &str, record: Rc<ModuleRecord<G::Value>>) {
        if let Some(guest) = self.guest.upgrade()
            && let Err(err) = guest.set(&self.cache_object, key, record.module.clone())
        {
            tracing::debug!("mirroring {} into require.cache failed: {}", key, guest.describe(err));
        }
        self.cache.borrow_mut().insert(key.to_string(), record);
    }

    fn evict(&self, key: &str) {
        if self.cache.borrow_mut().remove(key).is_none() {
            return;
        }
        if let Some(guest) = self.guest.upgrade()
            && let Err(err) = guest.set(&self.cache_object, key, guest.undefined())
        {
            tracing::debug!("evicting {} from require.cache failed: {}", key, guest.describe(err));
        }
    }

    pub fn record(&self, key: &str) -> Option<Rc<ModuleRecord<G::Value>>> {
        self.cache.borrow().get(key).cloned()
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.cache.borrow().contains_key(key)
    }

    /// `require(name)` from a module in `from_dir`.
    pub fn require(&self, name: &str, from_dir: &Path) -> GuestResult<G::Value, G::Value> {
        if let Some(exports) = self.get(name) {
            tracing::trace!("require cache hit: {}", name);
            return Ok(exports);
        }
        match self.resolve(name, from_dir)? {
            Resolved::Builtin(name) => self.load_builtin(&name),
            Resolved::File(file) => self.load_file(&file),
            Resolved::Package { dir, entry } => {
                let exports = self.load_file(&entry)?;
                self.alias_record(&path::to_key(&dir), &path::to_key(&entry));
                Ok(exports)
            }
        }
    }

    /// Resolve `name` without loading it.
    pub fn resolve(&self, name: &str, from_dir: &Path) -> RuntimeResult<Resolved> {
        if self.builtins.borrow().claims(name) {
            return Ok(Resolved::Builtin(normalize_builtin(name).to_string()));
        }

        let explicit = path::is_explicit(name);
        let mut dir = path::normalize(from_dir);
        loop {
            tracing::trace!("resolving '{}' in {}", name, dir.display());
            if let Some(found) = self.resolve_in(&dir, name, explicit)? {
                tracing::debug!("resolved '{}' -> {:?}", name, found);
                return Ok(found);
            }
            if explicit {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
        Err(RuntimeError::not_found(name, from_dir.display()))
    }

    fn resolve_in(&self, dir: &Path, name: &str, explicit: bool) -> RuntimeResult<Option<Resolved>> {
        let candidate = path::join(dir, name);
        if self.is_file(&candidate) {
            return Ok(Some(Resolved::File(candidate)));
        }
        let with_ext = path::with_extension(&candidate, &self.config.script_extension);
        if self.is_file(&with_ext) {
            return Ok(Some(Resolved::File(with_ext)));
        }
        if let Some(found) = self.resolve_package(&candidate, None)? {
            return Ok(Some(found));
        }
        if !explicit {
            let package_dir = dir.join(&self.config.modules_dir).join(name);
            if let Some(found) = self.resolve_package(&path::normalize(&package_dir), None)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.cache.borrow().contains_key(&path::to_key(path)) || self.reader.exists(path)
    }

    /// Entry file of the package at `dir`: `main_override`, else the
    /// descriptor's `main`, else the index file; each tried as is, with the
    /// script extension, and as a directory with an index file.
    fn resolve_package(&self, dir: &Path, main_override: Option<&str>) -> RuntimeResult<Option<Resolved>> {
        if let Some(record) = self.record(&path::to_key(dir)) {
            return Ok(Some(Resolved::Package {
                dir: dir.to_path_buf(),
                entry: PathBuf::from(&record.id),
            }));
        }

        let descriptor_path = dir.join(&self.config.package_descriptor);
        let descriptor = match self.reader.read(&descriptor_path) {
            Some(source) => serde_json::from_str::<PackageDescriptor>(&source).map_err(|e| {
                RuntimeError::ModuleParse {
                    path: path::to_key(&descriptor_path),
                    message: e.to_string(),
                }
            })?,
            None => PackageDescriptor::default(),
        };
        let main = main_override
            .map(str::to_string)
            .or(descriptor.main)
            .unwrap_or_else(|| self.config.index_file.clone());

        let entry = path::join(dir, &main);
        let candidates = [
            entry.clone(),
            path::with_extension(&entry, &self.config.script_extension),
            entry.join(&self.config.index_file),
        ];
        Ok(candidates.into_iter().find(|c| self.is_file(c)).map(|entry| Resolved::Package {
            dir: dir.to_path_buf(),
            entry,
        }))
    }

    fn alias_record(&self, alias: &str, key: &str) {
        if self.is_cached(alias) {
            return;
        }
        if let Some(record) = self.record(key) {
            self.insert_record(alias, record);
        }
    }

    fn load_builtin(&self, name: &str) -> GuestResult<G::Value, G::Value> {
        if let Some(exports) = self.get(name) {
            return Ok(exports);
        }
        let entry = self.builtins.borrow().get(name);
        match entry {
            Some(BuiltinEntry::Object(exports)) => {
                let guest = self.guest()?;
                let module = guest.object();
                guest.set(&module, "exports", exports.clone())?;
                self.insert_record(
                    name,
                    Rc::new(ModuleRecord {
                        id: name.to_string(),
                        module,
                        state: Cell::new(ModuleState::Loaded),
                    }),
                );
                Ok(exports)
            }
            Some(BuiltinEntry::Package { name: package, main }) => {
                let found = self.find_installed_package(&package, main.as_deref())?;
                let Resolved::Package { entry, .. } = &found else {
                    return Err(RuntimeError::internal(format!("unexpected resolution for {package}")).into());
                };
                let exports = self.load_file(entry)?;
                self.alias_record(name, &found.key());
                Ok(exports)
            }
            None => {
                tracing::error!("built-in '{}' required before it was installed", name);
                Err(RuntimeError::MissingBuiltin(name.to_string()).into())
            }
        }
    }

    /// Look for `package` in the module directories from the root upward.
    fn find_installed_package(&self, package: &str, main: Option<&str>) -> RuntimeResult<Resolved> {
        for dir in self.root.ancestors() {
            let package_dir = path::normalize(&dir.join(&self.config.modules_dir).join(package));
            if let Some(found) = self.resolve_package(&package_dir, main)? {
                return Ok(found);
            }
        }
        Err(RuntimeError::not_found(package, self.root.display()))
    }

    /// Load (or fetch from cache) the module file at `file`.
    pub fn load_file(&self, file: &Path) -> GuestResult<G::Value, G::Value> {
        let key = path::to_key(file);
        if let Some(exports) = self.get(&key) {
            return Ok(exports);
        }
        let source = self
            .reader
            .read(file)
            .ok_or_else(|| RuntimeError::not_found(key.clone(), path::dirname(file).display()))?;

        let is_data = file
            .extension()
            .is_some_and(|ext| ext == self.config.data_extension.as_str());
        if is_data {
            self.load_data(key, &source)
        } else {
            self.load_script(key, file, &source)
        }
    }

    fn load_data(&self, key: String, source: &str) -> GuestResult<G::Value, G::Value> {
        let guest = self.guest()?;
        let json: serde_json::Value = serde_json::from_str(source).map_err(|e| RuntimeError::ModuleParse {
            path: key.clone(),
            message: e.to_string(),
        })?;
        let exports = guest.from_json(&json);
        let module = guest.object();
        guest.set(&module, "exports", exports.clone())?;
        guest.set(&module, "id", guest.string(&key))?;
        self.insert_record(
            &key,
            Rc::new(ModuleRecord {
                id: key.clone(),
                module,
                state: Cell::new(ModuleState::Loaded),
            }),
        );
        Ok(exports)
    }

    fn load_script(&self, key: String, file: &Path, source: &str) -> GuestResult<G::Value, G::Value> {
        let guest = self.guest()?;
        let dirname = path::dirname(file);

        let module = guest.object();
        let exports = guest.object();
        guest.set(&module, "exports", exports.clone())?;
        guest.set(&module, "id", guest.string(&key))?;
        guest.set(&module, "filename", guest.string(&key))?;
        guest.set(&module, "loaded", guest.boolean(false))?;

        let record = Rc::new(ModuleRecord {
            id: key.clone(),
            module: module.clone(),
            state: Cell::new(ModuleState::Loading),
        });
        self.insert_record(&key, record.clone());
        tracing::debug!("evaluating module {}", key);

        let result = (|| {
            let function = guest.evaluate(&wrapper::wrap(source), &key)?;
            if function.kind() != ValueKind::Function {
                return Err(GuestError::from(RuntimeError::internal(format!(
                    "module wrapper for {key} did not evaluate to a function"
                ))));
            }
            let require = self.require_function(&dirname)?;
            let args = [
                exports.clone(),
                require,
                module.clone(),
                guest.string(&key),
                guest.string(&path::to_key(&dirname)),
                self.process_object(guest.as_ref()),
            ];
            guest.call(&function, &exports, &args)
        })();

        if let Err(err) = result {
            tracing::debug!("module {} failed, dropping cache entry", key);
            self.evict(&key);
            return Err(err);
        }
        record.state.set(ModuleState::Loaded);
        guest.set(&module, "loaded", guest.boolean(true))?;
        guest.get(&module, "exports")
    }

    /// The `process` wrapper argument: the installed `process` built-in,
    /// else the global `process`, else `undefined`.
    fn process_object(&self, guest: &G) -> G::Value {
        if let Some(BuiltinEntry::Object(process)) = self.builtins.borrow().get("process") {
            return process;
        }
        match guest.get(&guest.global(), "process") {
            Ok(process) => process,
            Err(err) => {
                tracing::debug!("reading global process failed: {}", guest.describe(err));
                guest.undefined()
            }
        }
    }

    /// A guest `require` function bound to `dir`, with `require.resolve`
    /// and `require.cache`.
    pub fn require_function(&self, dir: &Path) -> GuestResult<G::Value, G::Value> {
        let guest = self.guest()?;

        let loader = self.this.clone();
        let base = dir.to_path_buf();
        let require = guest.function(
            "require",
            Rc::new(move |guest: &G, _this: &G::Value, args: &[G::Value]| {
                let name = specifier_arg(guest, args)?;
                let loader = loader
                    .upgrade()
                    .ok_or_else(|| RuntimeError::internal("module loader has been dropped"))?;
                loader.require(&name, &base)
            }),
        );

        let loader = self.this.clone();
        let base = dir.to_path_buf();
        guest.set_function(&require, "resolve", move |guest, _this, args| {
            let name = specifier_arg(guest, args)?;
            let loader = loader
                .upgrade()
                .ok_or_else(|| RuntimeError::internal("module loader has been dropped"))?;
            let resolved = loader.resolve(&name, &base)?;
            Ok(guest.string(&resolved.key()))
        })?;
        guest.set(&require, "cache", self.cache_object.clone())?;

        Ok(require)
    }
}

fn specifier_arg<G: Guest>(guest: &G, args: &[G::Value]) -> GuestResult<String, G::Value> {
    match args.first() {
        Some(value) if value.kind() == ValueKind::String => guest
            .as_string(value)
            .ok_or_else(|| RuntimeError::type_error("string", "string").into()),
        Some(value) => Err(RuntimeError::type_error("module specifier string", value.kind().name()).into()),
        None => Err(RuntimeError::type_error("module specifier string", "undefined").into()),
    }
}
