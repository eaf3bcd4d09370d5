use super::{PushSink, ReadableAdapter, WritableAdapter, WriteCallback};
use crate::error::{GuestResult, RuntimeError};
use crate::guest::{Guest, GuestValue, ValueKind};
use crate::host_loop::HostLoop;
use bytes::Bytes;
use std::rc::{Rc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};

/// A set of methods a guest object must provide to play a stream role.
#[derive(Debug)]
pub struct Capability {
    pub name: &'static str,
    pub members: &'static [&'static str],
}

/// Target of a readable pump
pub const READABLE: Capability = Capability {
    name: "Readable",
    members: &["push", "emit", "destroy"],
};

/// Receives `_write`/`_final` from its own `write`/`end`
pub const WRITABLE: Capability = Capability {
    name: "Writable",
    members: &["write", "end", "emit", "destroy"],
};

pub const DUPLEX: Capability = Capability {
    name: "Duplex",
    members: &["push", "write", "end", "emit", "destroy"],
};

/// Guest readable consumed by host code through [`GuestSource`](super::GuestSource)
pub const PULL_SOURCE: Capability = Capability {
    name: "pull source",
    members: &["read", "on"],
};

/// Push sink backed by a guest stream object.
pub struct GuestStream<G: Guest> {
    guest: Weak<G>,
    host: HostLoop,
    object: G::Value,
}

impl<G: Guest> GuestStream<G> {
    pub fn new(guest: &Rc<G>, host: HostLoop, object: G::Value) -> Self {
        Self {
            guest: Rc::downgrade(guest),
            host,
            object,
        }
    }

    /// Verify `object` supplies every member of `capability`.
    pub fn check(guest: &G, object: &G::Value, capability: &Capability) -> Result<(), RuntimeError> {
        if !matches!(object.kind(), ValueKind::Object | ValueKind::Function) {
            return Err(RuntimeError::type_error(capability.name, object.kind().name()));
        }
        match capability.members.iter().find(|m| !guest.has_method(object, m)) {
            Some(missing) => Err(RuntimeError::type_error(
                format!("{} stream", capability.name),
                format!("object without '{missing}'"),
            )),
            None => Ok(()),
        }
    }

    pub fn object(&self) -> &G::Value {
        &self.object
    }

    fn call(&self, method: &str, args: impl FnOnce(&G) -> Vec<G::Value>) -> Option<G::Value> {
        let guest = self.guest.upgrade()?;
        let args = args(&guest);
        match guest.call_method(&self.object, method, &args) {
            Ok(value) => Some(value),
            Err(err) => {
                let err = guest.describe(err);
                tracing::warn!("stream.{}() threw: {}", method, err);
                self.host.report_unhandled(&err);
                None
            }
        }
    }

    fn emit(&self, event: &str) {
        self.call("emit", |guest| vec![guest.string(event)]);
    }
}

impl<G: Guest> PushSink for GuestStream<G> {
    fn push(&self, chunk: Bytes) -> bool {
        let Some(result) = self.call("push", |guest| vec![guest.bytes(chunk)]) else {
            return true;
        };
        match self.guest.upgrade() {
            Some(guest) => guest.truthy(&result),
            None => true,
        }
    }

    /// `push(null)` ends the readable side; `close` follows.
    fn end(&self) {
        self.call("push", |guest| vec![guest.null()]);
        self.emit("close");
    }

    fn fail(&self, error: RuntimeError) {
        self.call("destroy", |guest| vec![guest.runtime_error(&error)]);
    }
}

fn chunk_bytes<G: Guest>(guest: &G, chunk: &G::Value) -> GuestResult<Bytes, G::Value> {
    if chunk.kind() == ValueKind::String {
        return Ok(Bytes::from(guest.as_string(chunk).unwrap_or_default()));
    }
    guest
        .as_bytes(chunk)
        .ok_or_else(|| RuntimeError::type_error("Buffer or string chunk", chunk.kind().name()).into())
}

/// Wrap a guest `(err) => void` callback as a [`WriteCallback`].
fn write_callback<G: Guest>(guest: Weak<G>, host: HostLoop, callback: Option<G::Value>) -> WriteCallback {
    Box::new(move |err: Option<&RuntimeError>| {
        let (Some(guest), Some(callback)) = (guest.upgrade(), callback) else {
            return;
        };
        let args = match err {
            Some(err) => vec![guest.runtime_error(err)],
            None => vec![],
        };
        if let Err(err) = guest.call(&callback, &guest.undefined(), &args) {
            host.report_unhandled(&guest.describe(err));
        }
    })
}

/// Install `_read`, `_write`, `_final` and `_destroy` on a guest duplex so it
/// is driven by the given adapters.
pub fn bind_duplex<G, R, W>(
    guest: &Rc<G>,
    host: &HostLoop,
    object: &G::Value,
    readable: ReadableAdapter<R>,
    writable: WritableAdapter<W>,
) -> GuestResult<(), G::Value>
where
    G: Guest,
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let reader = readable.clone();
    guest.set_function(object, "_read", move |guest, _this, _args| {
        reader.request();
        Ok(guest.undefined())
    })?;

    let writer = writable.clone();
    let weak = Rc::downgrade(guest);
    let loop_handle = host.clone();
    guest.set_function(object, "_write", move |guest, _this, args| {
        let chunk = match args.first() {
            Some(chunk) => chunk_bytes(guest, chunk)?,
            None => Bytes::new(),
        };
        let callback = args.iter().skip(1).find(|a| a.is_function()).cloned();
        writer.write(chunk, write_callback(weak.clone(), loop_handle.clone(), callback));
        Ok(guest.undefined())
    })?;

    let writer = writable.clone();
    let weak = Rc::downgrade(guest);
    let loop_handle = host.clone();
    guest.set_function(object, "_final", move |guest, _this, args| {
        let callback = args.iter().find(|a| a.is_function()).cloned();
        writer.finish(write_callback(weak.clone(), loop_handle.clone(), callback));
        Ok(guest.undefined())
    })?;

    let loop_handle = host.clone();
    guest.set_function(object, "_destroy", move |guest, _this, args| {
        readable.destroy();
        writable.destroy();
        if let Some(callback) = args.iter().find(|a| a.is_function()) {
            let err = args.first().filter(|e| !e.is_nullish() && !e.is_function()).cloned();
            let err = err.unwrap_or_else(|| guest.null());
            if let Err(e) = guest.call(callback, &guest.undefined(), &[err]) {
                loop_handle.report_unhandled(&guest.describe(e));
            }
        }
        Ok(guest.undefined())
    })?;

    Ok(())
}
