//! node:dns - hostname lookup.
//!
//! Only `lookup()` is provided. IP literals and `localhost` are answered
//! without a query; everything else goes through a shared hickory resolver
//! configured from the system.

use crate::context::NodeContext;
use crate::options;
use hickory_resolver::TokioResolver;
use marten_runtime::{ArgParser, Guest, GuestResult, GuestValue, RuntimeError, ValueKind};
use serde::Deserialize;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::rc::Rc;
use std::sync::OnceLock;
use thiserror::Error;

/// Global resolver instance.
static RESOLVER: OnceLock<TokioResolver> = OnceLock::new();

/// Get or create the global resolver.
fn get_resolver() -> Result<&'static TokioResolver, DnsError> {
    match RESOLVER.get() {
        Some(r) => Ok(r),
        None => {
            let resolver = TokioResolver::builder_tokio()
                .map_err(|e| DnsError::ResolutionFailed(e.to_string()))?
                .build();
            Ok(RESOLVER.get_or_init(|| resolver))
        }
    }
}

/// DNS resolution errors.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("getaddrinfo ENOTFOUND {0}")]
    NotFound(String),

    #[error("Invalid address family: {0}")]
    InvalidFamily(u32),
}

impl DnsError {
    /// Node-style error code.
    pub fn code(&self) -> &'static str {
        match self {
            DnsError::ResolutionFailed(_) => "ESERVFAIL",
            DnsError::NotFound(_) => "ENOTFOUND",
            DnsError::InvalidFamily(_) => "ERR_INVALID_ARG_VALUE",
        }
    }
}

impl From<DnsError> for RuntimeError {
    fn from(err: DnsError) -> Self {
        match err {
            DnsError::InvalidFamily(family) => RuntimeError::type_error("family 0, 4 or 6", family.to_string()),
            other => RuntimeError::Io(io::Error::other(other.to_string())),
        }
    }
}

/// Result of a DNS lookup operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    /// The resolved IP address.
    pub address: String,
    /// Address family (4 for IPv4, 6 for IPv6).
    pub family: u8,
}

impl From<IpAddr> for LookupResult {
    fn from(ip: IpAddr) -> Self {
        Self {
            address: ip.to_string(),
            family: if ip.is_ipv4() { 4 } else { 6 },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LookupOptions {
    #[serde(default, deserialize_with = "options::integer")]
    family: Option<u32>,
    #[serde(default)]
    all: bool,
}

fn family_filter(family: Option<u32>) -> Result<Option<u8>, DnsError> {
    match family.unwrap_or(0) {
        0 => Ok(None),
        4 => Ok(Some(4)),
        6 => Ok(Some(6)),
        other => Err(DnsError::InvalidFamily(other)),
    }
}

/// Addresses `hostname` can be answered with locally, if any.
fn local_answer(hostname: &str) -> Option<Vec<IpAddr>> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Some(vec![ip]);
    }
    if hostname.eq_ignore_ascii_case("localhost") {
        return Some(vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)]);
    }
    None
}

/// Resolve `hostname` to every address of the requested family, in
/// resolver order.
///
/// This is `dns.lookup(hostname, { all: true })` in Node.js.
pub async fn lookup_all(hostname: &str, family: Option<u8>) -> Result<Vec<LookupResult>, DnsError> {
    let addresses = match local_answer(hostname) {
        Some(addresses) => addresses,
        None => {
            let resolver = get_resolver()?;
            let response = resolver
                .lookup_ip(hostname)
                .await
                .map_err(|e| DnsError::ResolutionFailed(e.to_string()))?;
            response.iter().collect()
        }
    };

    let results: Vec<LookupResult> = addresses
        .into_iter()
        .map(LookupResult::from)
        .filter(|r| family.is_none_or(|f| f == r.family))
        .collect();
    if results.is_empty() {
        return Err(DnsError::NotFound(hostname.to_string()));
    }
    Ok(results)
}

/// Lookup a hostname and return the first IP address.
///
/// This is equivalent to `dns.lookup()` in Node.js.
pub async fn lookup(hostname: &str, family: Option<u8>) -> Result<LookupResult, DnsError> {
    let mut results = lookup_all(hostname, family).await?;
    Ok(results.swap_remove(0))
}

fn lookup_error<G: Guest>(guest: &G, hostname: &str, err: DnsError) -> G::Value {
    let code = err.code();
    let value = guest.runtime_error(&err.into());
    guest.set_or_log(&value, "code", guest.string(code));
    guest.set_or_log(&value, "hostname", guest.string(hostname));
    value
}

/// `lookup(hostname[, options], callback)`
fn guest_lookup<G: Guest>(ctx: &Rc<NodeContext<G>>, guest: &G, args: &[G::Value]) -> GuestResult<(), G::Value> {
    let mut parser = ArgParser::new(args);
    let hostname = parser
        .next(ValueKind::String)
        .and_then(|h| guest.as_string(h))
        .ok_or_else(|| RuntimeError::type_error("hostname string", kind_of(args.first())))?;
    let options = match parser.next_any(&[ValueKind::Number, ValueKind::Object]) {
        Some(value) if value.kind() == ValueKind::Number => LookupOptions {
            family: guest.as_number(value).map(|n| n as u32),
            all: false,
        },
        Some(value) => options::parse::<G, LookupOptions>(guest, value, "lookup")?,
        None => LookupOptions::default(),
    };
    let callback = parser
        .next_function()
        .cloned()
        .ok_or_else(|| RuntimeError::type_error("callback function", kind_of(parser.remaining().first())))?;
    let family = family_filter(options.family).map_err(RuntimeError::from)?;
    let all = options.all;

    tracing::debug!("dns lookup {} (family {:?}, all {})", hostname, family, all);
    let ctx = ctx.clone();
    ctx.host().clone().spawn(async move {
        let result = lookup_all(&hostname, family).await;
        let Ok(guest) = ctx.guest() else { return };
        let guest = guest.as_ref();
        let args = match result {
            Ok(results) if all => {
                let mut entries = Vec::with_capacity(results.len());
                for result in &results {
                    let entry = guest.object();
                    guest.set_or_log(&entry, "address", guest.string(&result.address));
                    guest.set_or_log(&entry, "family", guest.number(f64::from(result.family)));
                    entries.push(entry);
                }
                vec![guest.null(), guest.array(entries)]
            }
            Ok(results) => {
                let first = &results[0];
                vec![
                    guest.null(),
                    guest.string(&first.address),
                    guest.number(f64::from(first.family)),
                ]
            }
            Err(err) => vec![lookup_error(guest, &hostname, err)],
        };
        ctx.invoke(guest, &callback, &args);
    });
    Ok(())
}

fn kind_of<V: GuestValue>(value: Option<&V>) -> &'static str {
    value.map_or("undefined", |v| v.kind().name())
}

/// Exports of `require('dns')`.
pub fn module<G: Guest>(ctx: &Rc<NodeContext<G>>, guest: &G) -> GuestResult<G::Value, G::Value> {
    let exports = guest.object();
    let context = ctx.clone();
    guest.set_function(&exports, "lookup", move |guest, _this, args| {
        guest_lookup(&context, guest, args)?;
        Ok(guest.undefined())
    })?;
    Ok(exports)
}
