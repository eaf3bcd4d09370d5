//! Handles shared by every node module of one runtime.

use marten_runtime::{Guest, GuestResult, GuestValue, HostLoop, ModuleLoader, Runtime, RuntimeError, RuntimeResult};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

pub struct NodeContext<G: Guest> {
    guest: Weak<G>,
    host: HostLoop,
    loader: Weak<ModuleLoader<G>>,
    chunk_size: usize,
}

impl<G: Guest> NodeContext<G> {
    pub fn new(runtime: &Runtime<G>) -> Rc<Self> {
        Rc::new(Self {
            guest: Rc::downgrade(runtime.guest()),
            host: runtime.host().clone(),
            loader: Rc::downgrade(runtime.loader()),
            chunk_size: runtime.config().read_chunk_size,
        })
    }

    pub fn host(&self) -> &HostLoop {
        &self.host
    }

    /// Read size for socket pumps.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn guest(&self) -> RuntimeResult<Rc<G>> {
        self.guest
            .upgrade()
            .ok_or_else(|| RuntimeError::internal("guest context has been dropped"))
    }

    /// The guest `stream.Duplex` constructor sockets are built from.
    pub fn duplex_class(&self, guest: &G) -> GuestResult<G::Value, G::Value> {
        let loader = self
            .loader
            .upgrade()
            .ok_or_else(|| RuntimeError::internal("module loader has been dropped"))?;
        let stream = loader.require("stream", loader.root())?;
        let duplex = guest.get(&stream, "Duplex")?;
        if !duplex.is_function() {
            return Err(RuntimeError::type_error("stream.Duplex constructor", duplex.kind().name()).into());
        }
        Ok(duplex)
    }

    /// Call a guest callback. Exceptions go to the unhandled sink.
    pub fn invoke(&self, guest: &G, callback: &G::Value, args: &[G::Value]) {
        if let Err(err) = guest.call(callback, &guest.undefined(), args) {
            let err = guest.describe(err);
            tracing::warn!("callback threw: {}", err);
            self.host.report_unhandled(&err);
        }
    }

    /// `object.emit(event, ...args)`
    pub fn emit(&self, guest: &G, object: &G::Value, event: &str, args: &[G::Value]) {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(guest.string(event));
        all.extend_from_slice(args);
        if let Err(err) = guest.call_method(object, "emit", &all) {
            let err = guest.describe(err);
            tracing::warn!("emit('{}') threw: {}", event, err);
            self.host.report_unhandled(&err);
        }
    }

    /// Run `task` on a later loop turn, if the guest is still alive.
    pub fn post(&self, task: impl FnOnce(&G) + 'static) {
        let guest = self.guest.clone();
        self.host.post(move || {
            if let Some(guest) = guest.upgrade() {
                task(&guest);
            }
        });
    }

    /// Deliver `callback(err)` or `callback(null, ...values)` on a later turn.
    pub fn complete(
        self: &Rc<Self>,
        callback: Option<G::Value>,
        result: Result<Vec<G::Value>, RuntimeError>,
    ) {
        let Some(callback) = callback else {
            if let Err(err) = result {
                self.host.report_unhandled(&err);
            }
            return;
        };
        let ctx = self.clone();
        self.post(move |guest| {
            let args = match result {
                Ok(values) => std::iter::once(guest.null()).chain(values).collect::<Vec<_>>(),
                Err(err) => vec![guest.runtime_error(&err)],
            };
            ctx.invoke(guest, &callback, &args);
        });
    }
}

/// `"IPv4"` or `"IPv6"`
pub fn family_name(addr: &SocketAddr) -> &'static str {
    if addr.is_ipv4() { "IPv4" } else { "IPv6" }
}

/// `{ address, family, port }` for `addr`.
pub fn address_info<G: Guest>(guest: &G, addr: &SocketAddr) -> GuestResult<G::Value, G::Value> {
    let info = guest.object();
    guest.set(&info, "address", guest.string(&addr.ip().to_string()))?;
    guest.set(&info, "family", guest.string(family_name(addr)))?;
    guest.set(&info, "port", guest.number(f64::from(addr.port())))?;
    Ok(info)
}
