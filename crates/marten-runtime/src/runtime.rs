//! Runtime context and builder

use crate::config::RuntimeConfig;
use crate::error::{GuestResult, RuntimeError, RuntimeResult};
use crate::guest::Guest;
use crate::host_loop::HostLoop;
use crate::modules::reader::{FileReader, FsReader};
use crate::modules::{ModuleLoader, path};
use crate::scheduler::JobScheduler;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// One guest context wired to a host loop, module loader and scheduler.
pub struct Runtime<G: Guest> {
    guest: Rc<G>,
    host: HostLoop,
    loader: Rc<ModuleLoader<G>>,
    scheduler: Rc<JobScheduler<G>>,
    config: RuntimeConfig,
}

impl<G: Guest> Runtime<G> {
    pub fn builder(guest: G) -> RuntimeBuilder<G> {
        RuntimeBuilder::new(guest)
    }

    pub fn guest(&self) -> &Rc<G> {
        &self.guest
    }

    pub fn host(&self) -> &HostLoop {
        &self.host
    }

    pub fn loader(&self) -> &Rc<ModuleLoader<G>> {
        &self.loader
    }

    pub fn scheduler(&self) -> &Rc<JobScheduler<G>> {
        &self.scheduler
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a host object as built-in module `name`.
    pub fn define_builtin(&self, name: &str, exports: G::Value) {
        self.loader.define(name, exports);
    }

    /// `require(name)` as if called from a module in the root directory.
    pub fn require(&self, name: &str) -> GuestResult<G::Value, G::Value> {
        self.loader.require(name, self.loader.root())
    }

    /// Load the entry script at `path` (relative paths resolve from the root).
    pub fn load_main(&self, path: &Path) -> GuestResult<G::Value, G::Value> {
        let file = path::normalize(&self.loader.root().join(path));
        tracing::debug!("loading main module {}", file.display());
        self.loader.load_file(&file)
    }

    /// Drive the host loop until no work remains. Must run inside a `LocalSet`.
    pub async fn run(&self) {
        self.host.run().await;
    }

    /// Load the entry script, then run the loop to completion.
    pub async fn run_main(&self, path: &Path) -> RuntimeResult<()> {
        self.load_main(path).map_err(|e| self.guest.describe(e))?;
        self.run().await;
        Ok(())
    }
}

type BuiltinFactory<G> = Box<dyn FnOnce(&Runtime<G>) -> GuestResult<<G as Guest>::Value, <G as Guest>::Value>>;

/// Builder for [`Runtime`].
pub struct RuntimeBuilder<G: Guest> {
    guest: G,
    config: RuntimeConfig,
    reader: Option<Box<dyn FileReader>>,
    builtins: Vec<(String, BuiltinFactory<G>)>,
    unhandled: Option<Box<dyn Fn(&RuntimeError)>>,
}

impl<G: Guest> RuntimeBuilder<G> {
    pub fn new(guest: G) -> Self {
        Self {
            guest,
            config: RuntimeConfig::default(),
            reader: None,
            builtins: Vec::new(),
            unhandled: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root = root.into();
        self
    }

    /// Source of module files (default: the local filesystem).
    pub fn reader(mut self, reader: impl FileReader + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    /// Built-in module `name` with a fixed exports value.
    pub fn builtin(self, name: &str, exports: G::Value) -> Self {
        self.builtin_with(name, move |_| Ok(exports))
    }

    /// Built-in module `name` whose exports are created once the runtime exists.
    pub fn builtin_with<F>(mut self, name: &str, factory: F) -> Self
    where
        F: FnOnce(&Runtime<G>) -> GuestResult<G::Value, G::Value> + 'static,
    {
        self.builtins.push((name.to_string(), Box::new(factory)));
        self
    }

    pub fn on_unhandled(mut self, handler: impl Fn(&RuntimeError) + 'static) -> Self {
        self.unhandled = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> RuntimeResult<Runtime<G>> {
        let guest = Rc::new(self.guest);
        let host = HostLoop::new();
        if let Some(handler) = self.unhandled {
            host.set_unhandled_handler(handler);
        }

        let reader = self.reader.unwrap_or_else(|| Box::new(FsReader));
        let loader = ModuleLoader::new(&guest, reader, self.config.loader.clone(), self.config.root.clone());
        let scheduler = Rc::new(JobScheduler::new(&guest, host.clone()));
        scheduler.install(&guest).map_err(|e| guest.describe(e))?;
        let global = guest.global();
        guest
            .set(&global, "global", global.clone())
            .map_err(|e| guest.describe(e))?;

        let runtime = Runtime {
            guest,
            host,
            loader,
            scheduler,
            config: self.config,
        };
        for (name, factory) in self.builtins {
            let exports = factory(&runtime).map_err(|e| runtime.guest.describe(e))?;
            runtime.define_builtin(&name, exports);
        }
        tracing::debug!("runtime ready at {}", runtime.config.root.display());
        Ok(runtime)
    }
}
