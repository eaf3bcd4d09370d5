//! node:tls - TLS client connections using rustls.
//!
//! `tls.connect()` returns the same socket surface as `net.connect()`; the
//! handshake runs after the TCP connection is up and before the stream
//! adapters are attached, so `secureConnect` fires once the socket is usable.
//! Server certificates are verified against the platform's native roots.

use crate::context::NodeContext;
use crate::net::{self, Connection, Transport};
use marten_runtime::{Guest, GuestResult, RuntimeError};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Errors that can occur in TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Root cert store error: {0}")]
    RootCertStore(String),
}

pub type TlsResult<T> = Result<T, TlsError>;

impl From<TlsError> for RuntimeError {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::Io(err) => RuntimeError::Io(err),
            other => RuntimeError::Stream(other.to_string()),
        }
    }
}

static CLIENT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Client config over the native root store, built on first use.
fn client_config() -> TlsResult<Arc<ClientConfig>> {
    if let Some(config) = CLIENT_CONFIG.get() {
        return Ok(config.clone());
    }
    let mut root_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs().map_err(|e| TlsError::RootCertStore(e.to_string()))?;
    let (added, ignored) = root_store.add_parsable_certificates(native);
    tracing::debug!("loaded {} native root certificates ({} ignored)", added, ignored);

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(CLIENT_CONFIG.get_or_init(|| Arc::new(config)).clone())
}

/// Run the client handshake over `stream`, verifying the peer as `servername`.
pub(crate) async fn secure(stream: TcpStream, servername: String) -> TlsResult<Connection> {
    let local = stream.local_addr()?;
    let remote = stream.peer_addr()?;
    let name = ServerName::try_from(servername.clone()).map_err(|_| TlsError::InvalidServerName(servername))?;

    let connector = TlsConnector::from(client_config()?);
    let tls = connector.connect(name, stream).await?;
    tracing::debug!("TLS handshake with {} complete", remote);

    let (reader, writer) = tokio::io::split(tls);
    Ok(Connection {
        reader: Box::new(reader),
        writer: Box::new(writer),
        local,
        remote,
    })
}

/// Exports of `require('tls')`.
pub fn module<G: Guest>(ctx: &Rc<NodeContext<G>>, guest: &G) -> GuestResult<G::Value, G::Value> {
    let exports = guest.object();
    let context = ctx.clone();
    guest.set_function(&exports, "connect", move |guest, _this, args| {
        net::connect(&context, guest, Transport::Tls, args)
    })?;
    Ok(exports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_server_name_is_stream_error() {
        let err: RuntimeError = TlsError::InvalidServerName("bad name!".into()).into();
        assert!(matches!(err, RuntimeError::Stream(_)));
        assert!(err.to_string().contains("bad name!"));
    }

    #[test]
    fn test_server_name_forms() {
        assert!(ServerName::try_from("example.com".to_string()).is_ok());
        assert!(ServerName::try_from("127.0.0.1".to_string()).is_ok());
        assert!(ServerName::try_from("not a host".to_string()).is_err());
    }
}
