use super::guest::{GuestStream, PULL_SOURCE};
use crate::error::{GuestResult, RuntimeError, RuntimeResult};
use crate::gate::{Gate, Wake};
use crate::guest::{Guest, GuestValue, ValueKind};
use bytes::{Bytes, BytesMut};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Default)]
struct SourceState {
    readable: Gate,
    ended: Cell<bool>,
    error: RefCell<Option<RuntimeError>>,
}

/// Host-side pull reader over a guest readable stream.
///
/// Calls `stream.read()` until it returns null, then parks until the guest
/// emits `readable`, `end` or `error`.
pub struct GuestSource<G: Guest> {
    guest: Rc<G>,
    stream: G::Value,
    state: Rc<SourceState>,
}

impl<G: Guest> GuestSource<G> {
    pub fn new(guest: Rc<G>, stream: G::Value) -> GuestResult<Self, G::Value> {
        GuestStream::<G>::check(&guest, &stream, &PULL_SOURCE)?;
        let state = Rc::new(SourceState::default());

        let on_readable = state.clone();
        let listener = guest.function(
            "onReadable",
            Rc::new(move |guest: &G, _this: &G::Value, _args: &[G::Value]| {
                on_readable.readable.signal();
                Ok(guest.undefined())
            }),
        );
        guest.call_method(&stream, "on", &[guest.string("readable"), listener])?;

        let on_end = state.clone();
        let listener = guest.function(
            "onEnd",
            Rc::new(move |guest: &G, _this: &G::Value, _args: &[G::Value]| {
                on_end.ended.set(true);
                on_end.readable.close();
                Ok(guest.undefined())
            }),
        );
        guest.call_method(&stream, "on", &[guest.string("end"), listener])?;

        let on_error = state.clone();
        let listener = guest.function(
            "onError",
            Rc::new(move |guest: &G, _this: &G::Value, args: &[G::Value]| {
                let message = args
                    .first()
                    .map(|err| guest.describe(crate::error::GuestError::Thrown(err.clone())).to_string())
                    .unwrap_or_else(|| "stream error".to_string());
                on_error.error.borrow_mut().get_or_insert(RuntimeError::Stream(message));
                on_error.readable.close();
                Ok(guest.undefined())
            }),
        );
        guest.call_method(&stream, "on", &[guest.string("error"), listener])?;

        Ok(Self { guest, stream, state })
    }

    /// Next chunk, or `None` once the stream has ended.
    pub async fn read(&mut self) -> RuntimeResult<Option<Bytes>> {
        loop {
            if let Some(err) = self.state.error.borrow_mut().take() {
                return Err(err);
            }
            let value = self
                .guest
                .call_method(&self.stream, "read", &[])
                .map_err(|e| self.guest.describe(e))?;
            match value.kind() {
                ValueKind::Null | ValueKind::Undefined => {}
                ValueKind::String => {
                    let text = self.guest.as_string(&value).unwrap_or_default();
                    return Ok(Some(Bytes::from(text)));
                }
                _ => match self.guest.as_bytes(&value) {
                    Some(bytes) => return Ok(Some(bytes)),
                    None => {
                        return Err(RuntimeError::type_error("Buffer or string chunk", value.kind().name()));
                    }
                },
            }
            if self.state.ended.get() {
                return Ok(None);
            }
            if self.state.readable.wait().await == Wake::Closed
                && !self.state.ended.get()
                && self.state.error.borrow().is_none()
            {
                return Ok(None);
            }
        }
    }

    /// Read until end of stream.
    pub async fn read_to_end(&mut self) -> RuntimeResult<BytesMut> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub fn stream(&self) -> &G::Value {
        &self.stream
    }
}
