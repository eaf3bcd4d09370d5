//! node:dgram - UDP datagram sockets.
//!
//! Each bound socket runs one loop task that selects between incoming
//! datagrams and commands (send, connect, broadcast, close) queued by the
//! guest-facing methods. Commands issued before the socket is bound wait in
//! the queue; `send` on an unbound socket binds it to an ephemeral port first.
//!
//! ```javascript
//! const dgram = require('dgram');
//! const server = dgram.createSocket('udp4', (msg, rinfo) => {
//!   server.send(msg, rinfo.port, rinfo.address);
//! });
//! server.bind(41234);
//! ```

use crate::context::{NodeContext, address_info};
use crate::options;
use bytes::Bytes;
use marten_runtime::{ArgParser, Emitter, Guest, GuestResult, GuestValue, RuntimeError, ValueKind};
use serde::Deserialize;
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 65536;

/// Errors that can occur in dgram operations.
#[derive(Debug, Error)]
pub enum DgramError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Bad socket type specified. Valid types are: udp4, udp6 (got '{0}')")]
    InvalidType(String),

    #[error("Socket is already bound")]
    AlreadyBound,

    #[error("Not running")]
    NotRunning,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Destination port is required on an unconnected socket")]
    MissingDestination,

    #[error("Offset and length out of range for a {0}-byte message")]
    OutOfRange(usize),
}

pub type DgramResult<T> = Result<T, DgramError>;

impl From<DgramError> for RuntimeError {
    fn from(err: DgramError) -> Self {
        match err {
            DgramError::Io(err) => RuntimeError::Io(err),
            DgramError::InvalidType(kind) => RuntimeError::type_error("'udp4' or 'udp6'", kind),
            other => RuntimeError::Stream(other.to_string()),
        }
    }
}

/// UDP socket family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Udp4,
    Udp6,
}

impl SocketType {
    pub fn parse(s: &str) -> DgramResult<Self> {
        match s {
            "udp4" => Ok(SocketType::Udp4),
            "udp6" => Ok(SocketType::Udp6),
            other => Err(DgramError::InvalidType(other.to_string())),
        }
    }

    pub fn family(self) -> &'static str {
        match self {
            SocketType::Udp4 => "IPv4",
            SocketType::Udp6 => "IPv6",
        }
    }

    /// Address `bind()` uses when none is given.
    pub fn unspecified(self) -> &'static str {
        match self {
            SocketType::Udp4 => "0.0.0.0",
            SocketType::Udp6 => "::",
        }
    }

    /// Address `send()`/`connect()` use when only a port is given.
    pub fn loopback(self) -> &'static str {
        match self {
            SocketType::Udp4 => "127.0.0.1",
            SocketType::Udp6 => "::1",
        }
    }
}

/// Options for `createSocket(options)`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocketOptions {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    reuse_addr: bool,
    #[serde(default)]
    ipv6_only: bool,
}

/// Options for `bind(options)`.
#[derive(Debug, Default, Deserialize)]
struct BindOptions {
    #[serde(default, deserialize_with = "options::port")]
    port: Option<u16>,
    address: Option<String>,
}

type Reply<T> = Box<dyn FnOnce(io::Result<T>)>;

enum Command {
    Send {
        data: Bytes,
        target: Option<(String, u16)>,
        reply: Reply<usize>,
    },
    Connect {
        address: String,
        port: u16,
        reply: Reply<SocketAddr>,
    },
    Broadcast(bool),
    Close,
}

/// Host half of a guest dgram socket.
struct Udp<G: Guest> {
    ctx: Rc<NodeContext<G>>,
    emitter: Rc<Emitter<G>>,
    kind: SocketType,
    commands: mpsc::UnboundedSender<Command>,
    /// Taken by the loop task when the socket is bound
    receiver: RefCell<Option<mpsc::UnboundedReceiver<Command>>>,
    local: Cell<Option<SocketAddr>>,
    remote: Cell<Option<SocketAddr>>,
    broadcast: Cell<bool>,
    bound: Cell<bool>,
    /// `connect()` was called; cleared again if it fails
    connected: Cell<bool>,
    closed: Cell<bool>,
}

impl<G: Guest> Udp<G> {
    fn new(ctx: &Rc<NodeContext<G>>, guest: &Rc<G>, kind: SocketType) -> Rc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        Rc::new(Self {
            ctx: ctx.clone(),
            emitter: Emitter::new(guest, ctx.host().clone()),
            kind,
            commands,
            receiver: RefCell::new(Some(receiver)),
            local: Cell::new(None),
            remote: Cell::new(None),
            broadcast: Cell::new(false),
            bound: Cell::new(false),
            connected: Cell::new(false),
            closed: Cell::new(false),
        })
    }

    fn ensure_open(&self) -> DgramResult<()> {
        if self.closed.get() { Err(DgramError::NotRunning) } else { Ok(()) }
    }

    fn bind(self: &Rc<Self>, object: &G::Value, port: u16, address: Option<String>) -> DgramResult<()> {
        self.ensure_open()?;
        if self.bound.replace(true) {
            return Err(DgramError::AlreadyBound);
        }
        let receiver = self.receiver.borrow_mut().take().ok_or(DgramError::AlreadyBound)?;
        let address = address.unwrap_or_else(|| self.kind.unspecified().to_string());
        tracing::debug!("binding {:?} socket to {}:{}", self.kind, address, port);
        self.ctx
            .host()
            .spawn(socket_loop(self.clone(), object.clone(), address, port, receiver));
        Ok(())
    }

    fn bind_default(self: &Rc<Self>, object: &G::Value) -> DgramResult<()> {
        if self.bound.get() { Ok(()) } else { self.bind(object, 0, None) }
    }

    fn queue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("dgram loop has exited; command dropped");
        }
    }

    fn emit_error(&self, object: &G::Value, err: RuntimeError) {
        if let Ok(guest) = self.ctx.guest() {
            let err = guest.runtime_error(&err);
            self.emitter.emit(object, "error", &[err]);
        }
    }

    fn message(&self, object: &G::Value, data: Bytes, peer: SocketAddr) -> GuestResult<(), G::Value> {
        let guest = self.ctx.guest()?;
        let size = data.len();
        let rinfo = address_info(guest.as_ref(), &peer)?;
        guest.set(&rinfo, "size", guest.number(size as f64))?;
        tracing::trace!("datagram of {} bytes from {}", size, peer);
        self.emitter.emit(object, "message", &[guest.bytes(data), rinfo]);
        Ok(())
    }

    fn send(self: &Rc<Self>, guest: &G, object: &G::Value, args: &[G::Value]) -> GuestResult<(), G::Value> {
        self.ensure_open().map_err(RuntimeError::from)?;
        let mut parser = ArgParser::new(args);
        let message = parser
            .next_any(&[ValueKind::Bytes, ValueKind::String])
            .ok_or_else(|| RuntimeError::type_error("Buffer or string message", kind_of(args.first())))?;
        let mut data = match guest.as_bytes(message) {
            Some(bytes) => bytes,
            None => Bytes::from(guest.as_string(message).unwrap_or_default()),
        };

        let mut numbers = Vec::with_capacity(3);
        while numbers.len() < 3 {
            match parser.next(ValueKind::Number).and_then(|n| guest.as_number(n)) {
                Some(n) => numbers.push(n),
                None => break,
            }
        }
        let port = match numbers.as_slice() {
            [] => None,
            [port] => Some(*port),
            [offset, length] => {
                data = slice(&data, *offset, *length).map_err(RuntimeError::from)?;
                None
            }
            [offset, length, port, ..] => {
                data = slice(&data, *offset, *length).map_err(RuntimeError::from)?;
                Some(*port)
            }
        };
        let address = parser.next(ValueKind::String).and_then(|a| guest.as_string(a));
        let callback = parser.next_function().cloned();

        let target = match port {
            Some(_) if self.connected.get() => return Err(RuntimeError::from(DgramError::AlreadyConnected).into()),
            Some(port) => {
                let port = options::port_number(port)?;
                Some((address.unwrap_or_else(|| self.kind.loopback().to_string()), port))
            }
            None if self.connected.get() => None,
            None => return Err(RuntimeError::from(DgramError::MissingDestination).into()),
        };
        self.bind_default(object).map_err(RuntimeError::from)?;

        let (udp, target_object) = (self.clone(), object.clone());
        let reply: Reply<usize> = Box::new(move |result| {
            let Ok(guest) = udp.ctx.guest() else { return };
            match (callback, result) {
                (Some(callback), Ok(sent)) => {
                    udp.ctx.invoke(guest.as_ref(), &callback, &[guest.null(), guest.number(sent as f64)])
                }
                (Some(callback), Err(err)) => {
                    let err = guest.runtime_error(&RuntimeError::Io(err));
                    udp.ctx.invoke(guest.as_ref(), &callback, &[err]);
                }
                (None, Ok(_)) => {}
                (None, Err(err)) => udp.emit_error(&target_object, RuntimeError::Io(err)),
            }
        });
        self.queue(Command::Send { data, target, reply });
        Ok(())
    }

    fn connect(self: &Rc<Self>, guest: &G, object: &G::Value, args: &[G::Value]) -> GuestResult<(), G::Value> {
        self.ensure_open().map_err(RuntimeError::from)?;
        if self.connected.get() {
            return Err(RuntimeError::from(DgramError::AlreadyConnected).into());
        }
        let mut parser = ArgParser::new(args);
        let port = parser
            .next_any(&[ValueKind::Number, ValueKind::String])
            .ok_or_else(|| RuntimeError::type_error("port", kind_of(args.first())))?;
        let port = options::port_arg(guest, port)?;
        let address = parser
            .next(ValueKind::String)
            .and_then(|a| guest.as_string(a))
            .unwrap_or_else(|| self.kind.loopback().to_string());
        if let Some(callback) = parser.next_function() {
            self.emitter.once("connect", callback.clone());
        }
        self.bind_default(object).map_err(RuntimeError::from)?;
        self.connected.set(true);

        let (udp, target) = (self.clone(), object.clone());
        let reply: Reply<SocketAddr> = Box::new(move |result| match result {
            Ok(peer) => {
                udp.remote.set(Some(peer));
                udp.emitter.emit(&target, "connect", &[]);
            }
            Err(err) => {
                udp.connected.set(false);
                udp.emit_error(&target, RuntimeError::Io(err));
            }
        });
        self.queue(Command::Connect { address, port, reply });
        Ok(())
    }

    fn close(&self, object: &G::Value, callback: Option<G::Value>) -> DgramResult<()> {
        if self.closed.replace(true) {
            return Err(DgramError::NotRunning);
        }
        if let Some(callback) = callback {
            self.emitter.once("close", callback);
        }
        if self.bound.get() && self.commands.send(Command::Close).is_ok() {
            return Ok(());
        }
        self.emitter.emit_later(object, "close", Vec::new());
        Ok(())
    }
}

fn kind_of<V: GuestValue>(value: Option<&V>) -> &'static str {
    value.map_or("undefined", |v| v.kind().name())
}

/// `data[offset..offset + length]`, bounds-checked.
fn slice(data: &Bytes, offset: f64, length: f64) -> DgramResult<Bytes> {
    let valid = |n: f64| n >= 0.0 && n.fract() == 0.0;
    if !valid(offset) || !valid(length) || offset + length > data.len() as f64 {
        return Err(DgramError::OutOfRange(data.len()));
    }
    let start = offset as usize;
    Ok(data.slice(start..start + length as usize))
}

async fn socket_loop<G: Guest>(
    udp: Rc<Udp<G>>,
    object: G::Value,
    address: String,
    port: u16,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let socket = match UdpSocket::bind((address.as_str(), port)).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::debug!("bind {}:{} failed: {}", address, port, err);
            udp.bound.set(false);
            udp.emit_error(&object, RuntimeError::Io(err));
            return;
        }
    };
    if let Err(err) = socket.set_broadcast(udp.broadcast.get()) {
        tracing::warn!("setBroadcast failed: {}", err);
    }
    udp.local.set(socket.local_addr().ok());
    udp.emitter.emit(&object, "listening", &[]);

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if let Err(err) = udp.message(&object, data, peer) {
                        tracing::warn!("message delivery failed: {:?}", err);
                    }
                }
                Err(err) => {
                    tracing::debug!("recv_from failed: {}", err);
                    udp.emit_error(&object, RuntimeError::Io(err));
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send { data, target, reply }) => {
                    let result = match target {
                        Some((host, port)) => socket.send_to(&data, (host.as_str(), port)).await,
                        None => socket.send(&data).await,
                    };
                    reply(result);
                }
                Some(Command::Connect { address, port, reply }) => {
                    let result = match socket.connect((address.as_str(), port)).await {
                        Ok(()) => socket.peer_addr(),
                        Err(err) => Err(err),
                    };
                    reply(result);
                }
                Some(Command::Broadcast(enabled)) => {
                    if let Err(err) = socket.set_broadcast(enabled) {
                        udp.emit_error(&object, RuntimeError::Io(err));
                    }
                }
                Some(Command::Close) | None => break,
            },
        }
    }

    drop(socket);
    udp.local.set(None);
    udp.remote.set(None);
    tracing::debug!("dgram socket closed");
    udp.emitter.emit(&object, "close", &[]);
}

fn create_socket<G: Guest>(ctx: &Rc<NodeContext<G>>, guest: &Rc<G>, args: &[G::Value]) -> GuestResult<G::Value, G::Value> {
    let mut parser = ArgParser::new(args);
    let kind = match parser.next_any(&[ValueKind::String, ValueKind::Object]) {
        Some(value) if value.kind() == ValueKind::String => guest.as_string(value).unwrap_or_default(),
        Some(value) => {
            let parsed = options::parse::<G, SocketOptions>(guest.as_ref(), value, "createSocket")?;
            if parsed.reuse_addr || parsed.ipv6_only {
                tracing::debug!("reuseAddr/ipv6Only are accepted but not applied");
            }
            parsed.kind.unwrap_or_default()
        }
        None => return Err(RuntimeError::type_error("socket type or options", kind_of(args.first())).into()),
    };
    let kind = SocketType::parse(&kind).map_err(RuntimeError::from)?;

    let object = guest.object();
    let udp = Udp::new(ctx, guest, kind);
    udp.emitter.install(guest.as_ref(), &object)?;
    if let Some(callback) = parser.next_function() {
        udp.emitter.on("message", callback.clone());
    }

    let socket = udp.clone();
    guest.set_function(&object, "bind", move |guest, this, args| {
        let mut parser = ArgParser::new(args);
        let (port, address) = match parser.next_object() {
            Some(value) => {
                let parsed = options::parse::<G, BindOptions>(guest, value, "bind")?;
                (parsed.port.unwrap_or(0), parsed.address)
            }
            None => {
                let port = match parser.next_any(&[ValueKind::Number, ValueKind::String]) {
                    Some(port) => options::port_arg(guest, port)?,
                    None => 0,
                };
                (port, parser.next(ValueKind::String).and_then(|a| guest.as_string(a)))
            }
        };
        if let Some(callback) = parser.next_function() {
            socket.emitter.once("listening", callback.clone());
        }
        socket.bind(this, port, address).map_err(RuntimeError::from)?;
        Ok(this.clone())
    })?;

    let socket = udp.clone();
    guest.set_function(&object, "send", move |guest, this, args| {
        socket.send(guest, this, args)?;
        Ok(guest.undefined())
    })?;

    let socket = udp.clone();
    guest.set_function(&object, "connect", move |guest, this, args| {
        socket.connect(guest, this, args)?;
        Ok(guest.undefined())
    })?;

    let socket = udp.clone();
    guest.set_function(&object, "close", move |_guest, this, args| {
        let callback = ArgParser::new(args).trailing_function().cloned();
        socket.close(this, callback).map_err(RuntimeError::from)?;
        Ok(this.clone())
    })?;

    let socket = udp.clone();
    guest.set_function(&object, "address", move |guest, _this, _args| match socket.local.get() {
        Some(addr) => address_info(guest, &addr),
        None => Err(RuntimeError::from(DgramError::NotRunning).into()),
    })?;

    let socket = udp.clone();
    guest.set_function(&object, "remoteAddress", move |guest, _this, _args| match socket.remote.get() {
        Some(addr) => address_info(guest, &addr),
        None => Err(RuntimeError::Stream("Not connected".to_string()).into()),
    })?;

    let socket = udp;
    guest.set_function(&object, "setBroadcast", move |guest, _this, args| {
        let enabled = args.first().is_some_and(|v| guest.truthy(v));
        socket.broadcast.set(enabled);
        if socket.bound.get() {
            socket.queue(Command::Broadcast(enabled));
        }
        Ok(guest.undefined())
    })?;

    for name in ["ref", "unref"] {
        guest.set_function(&object, name, |_guest, this, _args| Ok(this.clone()))?;
    }
    Ok(object)
}

/// Exports of `require('dgram')`.
pub fn module<G: Guest>(ctx: &Rc<NodeContext<G>>, guest: &G) -> GuestResult<G::Value, G::Value> {
    let exports = guest.object();
    let context = ctx.clone();
    guest.set_function(&exports, "createSocket", move |_guest, _this, args| {
        let guest = context.guest()?;
        create_socket(&context, &guest, args)
    })?;
    Ok(exports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_type() {
        assert_eq!(SocketType::parse("udp4").unwrap(), SocketType::Udp4);
        assert_eq!(SocketType::parse("udp6").unwrap().family(), "IPv6");
        assert!(matches!(SocketType::parse("tcp"), Err(DgramError::InvalidType(_))));
        assert_eq!(SocketType::Udp4.unspecified(), "0.0.0.0");
        assert_eq!(SocketType::Udp6.loopback(), "::1");
    }

    #[test]
    fn test_slice_bounds() {
        let data = Bytes::from_static(b"hello world");
        assert_eq!(slice(&data, 6.0, 5.0).unwrap(), Bytes::from_static(b"world"));
        assert_eq!(slice(&data, 0.0, 0.0).unwrap().len(), 0);
        assert!(matches!(slice(&data, 6.0, 6.0), Err(DgramError::OutOfRange(11))));
        assert!(slice(&data, -1.0, 2.0).is_err());
        assert!(slice(&data, 0.5, 2.0).is_err());
    }

    #[test]
    fn test_invalid_type_is_type_error() {
        let err: RuntimeError = DgramError::InvalidType("tcp".into()).into();
        assert_eq!(err.code(), Some("ERR_INVALID_ARG_TYPE"));
    }
}
