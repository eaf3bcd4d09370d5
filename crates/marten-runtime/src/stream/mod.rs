//! Async stream bridge
//!
//! Connects pull-based native I/O (`AsyncRead`/`AsyncWrite`) with push-based
//! guest streams:
//!
//! - [`ReadableAdapter`] pumps a native reader into a [`PushSink`], pausing on
//!   a [`Gate`](crate::gate::Gate) when the sink rejects a chunk.
//! - [`WritableAdapter`] drains guest writes into a native writer.
//! - [`GuestSource`] lets host code pull from a guest-implemented readable.
//! - [`GuestStream`] is the [`PushSink`] backed by a guest stream object, and
//!   [`bind_duplex`] wires both adapters into one.

mod guest;
mod readable;
mod source;
mod writable;

pub use guest::{Capability, DUPLEX, GuestStream, PULL_SOURCE, READABLE, WRITABLE, bind_duplex};
pub use readable::ReadableAdapter;
pub use source::GuestSource;
pub use writable::{WritableAdapter, WriteCallback};

use crate::error::RuntimeError;
use bytes::Bytes;

/// Consumer side of a readable pump.
pub trait PushSink {
    /// Deliver one chunk. Returning `false` asks the producer to pause until
    /// it is resumed.
    fn push(&self, chunk: Bytes) -> bool;

    /// The source is exhausted.
    fn end(&self);

    /// The source failed.
    fn fail(&self, error: RuntimeError);
}
