//! Node.js protocol modules for marten
//!
//! Host implementations of `net`, `tls`, `dgram`, `dns`, `fs` and `crypto`,
//! registered as built-in modules of a [`Runtime`]. Sockets are guest
//! `stream.Duplex` instances driven by the runtime's stream bridge, so the
//! `stream` built-in must be available before the first socket is created.
//!
//! ```ignore
//! let runtime = Runtime::builder(engine).root("/srv/app").build()?;
//! marten_node::install_default_modules(&runtime)?;
//! ```

pub mod context;
pub mod crypto;
pub mod dgram;
pub mod dns;
pub mod fs;
pub mod net;
mod options;
pub mod tls;

pub use context::NodeContext;
pub use crypto::{CryptoError, Hash, HashAlgorithm};
pub use dgram::{DgramError, SocketType};
pub use dns::{DnsError, LookupResult};
pub use net::NetError;
pub use tls::TlsError;

use marten_runtime::{Guest, GuestResult, Runtime};

/// Built-in names installed by [`install_default_modules`].
pub const MODULES: &[&str] = &["net", "tls", "dgram", "dns", "fs", "crypto"];

/// Register every module in [`MODULES`] with `runtime`.
pub fn install_default_modules<G: Guest>(runtime: &Runtime<G>) -> GuestResult<(), G::Value> {
    let ctx = NodeContext::new(runtime);
    let guest = runtime.guest();

    runtime.define_builtin("net", net::module(&ctx, guest)?);
    runtime.define_builtin("tls", tls::module(&ctx, guest)?);
    runtime.define_builtin("dgram", dgram::module(&ctx, guest)?);
    runtime.define_builtin("dns", dns::module(&ctx, guest)?);
    runtime.define_builtin("fs", fs::module(&ctx, guest)?);
    runtime.define_builtin("crypto", crypto::module(&ctx, guest)?);

    tracing::debug!("installed node modules: {}", MODULES.join(", "));
    Ok(())
}
