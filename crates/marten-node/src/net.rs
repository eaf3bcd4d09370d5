//! node:net - TCP sockets and servers.
//!
//! A socket is an instance of the guest `stream.Duplex` class whose
//! `_read`/`_write`/`_final`/`_destroy` are bound to host stream adapters.
//! The adapters start without a native stream: connecting (or accepting)
//! attaches the two halves, so writes made while `connecting` queue up and
//! a `data` listener added early simply waits.
//!
//! ```javascript
//! const net = require('net');
//!
//! const server = net.createServer((socket) => socket.pipe(socket));
//! server.listen(0, () => {
//!   const client = net.connect(server.address().port, () => client.end('ping'));
//!   client.on('data', (data) => console.log(data.toString()));
//! });
//! ```

use crate::context::{NodeContext, address_info, family_name};
use crate::options;
use marten_runtime::stream::{DUPLEX, bind_duplex};
use marten_runtime::{
    ArgParser, Emitter, Gate, Guest, GuestResult, GuestStream, GuestValue, ReadableAdapter, RuntimeError, ValueKind,
    Wake, WritableAdapter,
};
use serde::Deserialize;
use std::cell::{Cell, RefCell};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Errors that can occur in net operations.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Server already listening")]
    AlreadyListening,

    #[error("Server is not running")]
    NotRunning,

    #[error("Socket is already connected")]
    AlreadyConnected,
}

pub type NetResult<T> = Result<T, NetError>;

impl From<NetError> for RuntimeError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Io(err) => RuntimeError::Io(err),
            other => RuntimeError::Stream(other.to_string()),
        }
    }
}

pub(crate) type BoxedReader = Box<dyn AsyncRead + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Unpin>;

const DEFAULT_CONNECT_HOST: &str = "localhost";
const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Options for `connect()` and `socket.connect()`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    #[serde(default, deserialize_with = "options::port")]
    pub port: Option<u16>,
    pub host: Option<String>,
    #[serde(default)]
    pub no_delay: bool,
    /// SNI name for TLS connections (defaults to `host`).
    pub servername: Option<String>,
}

/// Options for `server.listen()`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenOptions {
    #[serde(default, deserialize_with = "options::port")]
    pub port: Option<u16>,
    pub host: Option<String>,
}

/// 4 for an IPv4 literal, 6 for IPv6, 0 otherwise.
pub fn ip_version(input: &str) -> u8 {
    if input.parse::<Ipv4Addr>().is_ok() {
        4
    } else if input.parse::<Ipv6Addr>().is_ok() {
        6
    } else {
        0
    }
}

/// `connect(port[, host][, listener])` or `connect(options[, listener])`.
pub(crate) fn connect_args<G: Guest>(
    guest: &G,
    args: &[G::Value],
) -> GuestResult<(ConnectOptions, Option<G::Value>), G::Value> {
    let mut parser = ArgParser::new(args);
    let options = match parser.next_object() {
        Some(object) => options::parse::<G, ConnectOptions>(guest, object, "connect")?,
        None => {
            let port = parser
                .next_any(&[ValueKind::Number, ValueKind::String])
                .ok_or_else(|| RuntimeError::type_error("port or options", kind_of(args.first())))?;
            ConnectOptions {
                port: Some(options::port_arg(guest, port)?),
                host: parser.next(ValueKind::String).and_then(|h| guest.as_string(h)),
                ..ConnectOptions::default()
            }
        }
    };
    if options.port.is_none() {
        return Err(RuntimeError::type_error("options.port", "undefined").into());
    }
    Ok((options, parser.next_function().cloned()))
}

fn kind_of<V: GuestValue>(value: Option<&V>) -> &'static str {
    value.map_or("undefined", |v| v.kind().name())
}

/// How a client socket reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Tcp,
    Tls,
}

impl Transport {
    /// Event a `connect()` listener is registered for.
    fn listener_event(self) -> &'static str {
        match self {
            Transport::Tcp => "connect",
            Transport::Tls => "secureConnect",
        }
    }

    fn connected_events(self) -> &'static [&'static str] {
        match self {
            Transport::Tcp => &["connect", "ready"],
            Transport::Tls => &["connect", "secureConnect", "ready"],
        }
    }

    async fn open(self, host: &str, port: u16, no_delay: bool, servername: Option<String>) -> Result<Connection, RuntimeError> {
        let stream = TcpStream::connect((host, port)).await.map_err(NetError::from)?;
        stream.set_nodelay(no_delay).map_err(NetError::from)?;
        match self {
            Transport::Tcp => Ok(Connection::tcp(stream)?),
            Transport::Tls => {
                let name = servername.unwrap_or_else(|| host.to_string());
                Ok(crate::tls::secure(stream, name).await?)
            }
        }
    }
}

/// An established byte stream, split for the two adapters.
pub(crate) struct Connection {
    pub(crate) reader: BoxedReader,
    pub(crate) writer: BoxedWriter,
    pub(crate) local: SocketAddr,
    pub(crate) remote: SocketAddr,
}

impl Connection {
    pub(crate) fn tcp(stream: TcpStream) -> NetResult<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local,
            remote,
        })
    }
}

/// Host half of a guest socket.
pub(crate) struct Socket {
    transport: Transport,
    readable: ReadableAdapter<BoxedReader>,
    writable: WritableAdapter<BoxedWriter>,
    no_delay: Cell<bool>,
    connecting: Cell<bool>,
    local: Cell<Option<SocketAddr>>,
}

impl Socket {
    /// Construct a guest `Duplex` wired to a new, unconnected socket.
    pub(crate) fn create<G: Guest>(
        ctx: &Rc<NodeContext<G>>,
        guest: &Rc<G>,
        transport: Transport,
    ) -> GuestResult<(G::Value, Rc<Socket>), G::Value> {
        let class = ctx.duplex_class(guest)?;
        let object = guest.construct(&class, &[])?;
        GuestStream::check(guest.as_ref(), &object, &DUPLEX)?;

        let host = ctx.host();
        let sink = Rc::new(GuestStream::new(guest, host.clone(), object.clone()));
        let readable = ReadableAdapter::new(host.clone(), sink, ctx.chunk_size());
        let writable = WritableAdapter::new(host.clone());
        bind_duplex(guest, host, &object, readable.clone(), writable.clone())?;

        let socket = Rc::new(Socket {
            transport,
            readable,
            writable,
            no_delay: Cell::new(false),
            connecting: Cell::new(false),
            local: Cell::new(None),
        });
        socket.install(ctx, guest.as_ref(), &object)?;
        Ok((object, socket))
    }

    fn install<G: Guest>(self: &Rc<Self>, ctx: &Rc<NodeContext<G>>, guest: &G, object: &G::Value) -> GuestResult<(), G::Value> {
        guest.set(object, "connecting", guest.boolean(false))?;
        guest.set(object, "pending", guest.boolean(true))?;

        let (socket, context) = (self.clone(), ctx.clone());
        guest.set_function(object, "connect", move |guest, this, args| {
            let (options, listener) = connect_args(guest, args)?;
            socket.connect(&context, guest, this, options, listener)?;
            Ok(this.clone())
        })?;

        let socket = self.clone();
        guest.set_function(object, "address", move |guest, _this, _args| match socket.local.get() {
            Some(addr) => address_info(guest, &addr),
            None => Ok(guest.object()),
        })?;

        let socket = self.clone();
        guest.set_function(object, "setNoDelay", move |guest, this, args| {
            let enable = args.first().is_none_or(|v| v.is_nullish() || guest.truthy(v));
            socket.no_delay.set(enable);
            Ok(this.clone())
        })?;

        for name in ["setKeepAlive", "setTimeout", "ref", "unref"] {
            guest.set_function(object, name, |_guest, this, _args| Ok(this.clone()))?;
        }

        guest.set_function(object, "close", |guest, this, args| {
            if let Some(callback) = ArgParser::new(args).trailing_function() {
                guest.call_method(this, "once", &[guest.string("close"), callback.clone()])?;
            }
            guest.call_method(this, "end", &[])?;
            Ok(this.clone())
        })?;

        Ok(())
    }

    fn connect<G: Guest>(
        self: &Rc<Self>,
        ctx: &Rc<NodeContext<G>>,
        guest: &G,
        object: &G::Value,
        options: ConnectOptions,
        listener: Option<G::Value>,
    ) -> GuestResult<(), G::Value> {
        if self.connecting.get() || self.local.get().is_some() {
            return Err(RuntimeError::from(NetError::AlreadyConnected).into());
        }
        let port = options
            .port
            .ok_or_else(|| RuntimeError::type_error("options.port", "undefined"))?;
        if let Some(listener) = listener {
            guest.call_method(object, "once", &[guest.string(self.transport.listener_event()), listener])?;
        }
        if options.no_delay {
            self.no_delay.set(true);
        }
        self.connecting.set(true);
        guest.set(object, "connecting", guest.boolean(true))?;

        let host = options.host.unwrap_or_else(|| DEFAULT_CONNECT_HOST.to_string());
        tracing::debug!("{:?} connect to {}:{}", self.transport, host, port);

        let servername = options.servername;
        let (socket, ctx, object) = (self.clone(), ctx.clone(), object.clone());
        ctx.host().clone().spawn(async move {
            let result = socket
                .transport
                .open(&host, port, socket.no_delay.get(), servername)
                .await;
            socket.connecting.set(false);
            let Ok(guest) = ctx.guest() else { return };
            if socket.readable.is_destroyed() {
                tracing::debug!("socket destroyed while connecting to {}:{}", host, port);
                return;
            }
            match result {
                Ok(connection) => {
                    socket.established(&ctx, guest.as_ref(), &object, connection);
                    for event in socket.transport.connected_events() {
                        ctx.emit(guest.as_ref(), &object, event, &[]);
                    }
                }
                Err(err) => {
                    tracing::debug!("connect to {}:{} failed: {}", host, port, err);
                    guest.set_or_log(&object, "connecting", guest.boolean(false));
                    let err = guest.runtime_error(&err);
                    if let Err(e) = guest.call_method(&object, "destroy", &[err]) {
                        ctx.host().report_unhandled(&guest.describe(e));
                    }
                }
            }
        });
        Ok(())
    }

    /// Attach a live connection and publish its addresses on the guest object.
    pub(crate) fn established<G: Guest>(&self, ctx: &NodeContext<G>, guest: &G, object: &G::Value, connection: Connection) {
        let Connection {
            reader,
            writer,
            local,
            remote,
        } = connection;
        self.local.set(Some(local));
        if let Err(err) = publish_addresses(guest, object, &local, &remote) {
            ctx.host().report_unhandled(&guest.describe(err));
        }
        self.readable.attach(reader);
        self.writable.attach(writer);
    }
}

fn publish_addresses<G: Guest>(
    guest: &G,
    object: &G::Value,
    local: &SocketAddr,
    remote: &SocketAddr,
) -> GuestResult<(), G::Value> {
    guest.set(object, "connecting", guest.boolean(false))?;
    guest.set(object, "pending", guest.boolean(false))?;
    guest.set(object, "localAddress", guest.string(&local.ip().to_string()))?;
    guest.set(object, "localPort", guest.number(f64::from(local.port())))?;
    guest.set(object, "remoteAddress", guest.string(&remote.ip().to_string()))?;
    guest.set(object, "remotePort", guest.number(f64::from(remote.port())))?;
    guest.set(object, "remoteFamily", guest.string(family_name(remote)))?;
    Ok(())
}

/// Host half of a guest `Server`.
struct Server<G: Guest> {
    ctx: Rc<NodeContext<G>>,
    emitter: Rc<Emitter<G>>,
    local: Cell<Option<SocketAddr>>,
    /// Closed by `close()` to stop the accept loop; present while listening
    shutdown: RefCell<Option<Rc<Gate>>>,
}

impl<G: Guest> Server<G> {
    fn listen(self: &Rc<Self>, guest: &G, object: &G::Value, args: &[G::Value]) -> GuestResult<(), G::Value> {
        if self.shutdown.borrow().is_some() {
            return Err(RuntimeError::from(NetError::AlreadyListening).into());
        }
        let mut parser = ArgParser::new(args);
        let (port, host) = match parser.next_object() {
            Some(object) => {
                let options = options::parse::<G, ListenOptions>(guest, object, "listen")?;
                (options.port.unwrap_or(0), options.host)
            }
            None => {
                let port = match parser.next_any(&[ValueKind::Number, ValueKind::String]) {
                    Some(port) => options::port_arg(guest, port)?,
                    None => 0,
                };
                let host = parser.next(ValueKind::String).and_then(|h| guest.as_string(h));
                // backlog
                parser.next(ValueKind::Number);
                (port, host)
            }
        };
        if let Some(callback) = parser.next_function() {
            self.emitter.once("listening", callback.clone());
        }

        let host = host.unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string());
        let shutdown = Rc::new(Gate::new());
        *self.shutdown.borrow_mut() = Some(shutdown.clone());
        self.ctx
            .host()
            .spawn(serve(self.clone(), object.clone(), host, port, shutdown));
        Ok(())
    }

    fn close(&self, callback: Option<G::Value>) {
        let shutdown = self.shutdown.borrow_mut().take();
        match shutdown {
            Some(gate) => {
                if let Some(callback) = callback {
                    self.emitter.once("close", callback);
                }
                gate.close();
            }
            None => self.ctx.complete(callback, Err(NetError::NotRunning.into())),
        }
    }

    fn set_listening(&self, guest: &G, object: &G::Value, addr: Option<SocketAddr>) {
        self.local.set(addr);
        if let Err(err) = guest.set(object, "listening", guest.boolean(addr.is_some())) {
            self.ctx.host().report_unhandled(&guest.describe(err));
        }
    }

    fn accept(&self, guest: &Rc<G>, object: &G::Value, stream: TcpStream) -> GuestResult<(), G::Value> {
        let connection = Connection::tcp(stream).map_err(RuntimeError::from)?;
        tracing::debug!("accepted connection from {}", connection.remote);
        let (socket_object, socket) = Socket::create(&self.ctx, guest, Transport::Tcp)?;
        socket.established(&self.ctx, guest.as_ref(), &socket_object, connection);
        self.emitter.emit(object, "connection", &[socket_object]);
        Ok(())
    }
}

async fn serve<G: Guest>(server: Rc<Server<G>>, object: G::Value, host: String, port: u16, shutdown: Rc<Gate>) {
    let listener = match TcpListener::bind((host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::debug!("listen on {}:{} failed: {}", host, port, err);
            server.shutdown.borrow_mut().take();
            if let Ok(guest) = server.ctx.guest() {
                let err = guest.runtime_error(&NetError::Io(err).into());
                server.emitter.emit(&object, "error", &[err]);
            }
            return;
        }
    };

    if !shutdown.is_closed() {
        if let Ok(guest) = server.ctx.guest() {
            server.set_listening(guest.as_ref(), &object, listener.local_addr().ok());
            tracing::debug!("listening on {:?}", server.local.get());
            server.emitter.emit(&object, "listening", &[]);
        }

        loop {
            tokio::select! {
                wake = shutdown.wait() => {
                    if wake == Wake::Closed {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _peer)) => {
                        let Ok(guest) = server.ctx.guest() else { break };
                        if let Err(err) = server.accept(&guest, &object, stream) {
                            server.ctx.host().report_unhandled(&guest.describe(err));
                        }
                    }
                    Err(err) => tracing::warn!("accept failed: {}", err),
                },
            }
        }
    }

    drop(listener);
    if let Ok(guest) = server.ctx.guest() {
        server.set_listening(guest.as_ref(), &object, None);
        server.emitter.emit(&object, "close", &[]);
    }
}

fn create_server<G: Guest>(ctx: &Rc<NodeContext<G>>, guest: &Rc<G>, args: &[G::Value]) -> GuestResult<G::Value, G::Value> {
    let mut parser = ArgParser::new(args);
    // allowHalfOpen and pauseOnConnect are not supported
    parser.next_object();
    let object = guest.object();
    let server = Rc::new(Server {
        ctx: ctx.clone(),
        emitter: Emitter::new(guest, ctx.host().clone()),
        local: Cell::new(None),
        shutdown: RefCell::new(None),
    });
    server.emitter.install(guest.as_ref(), &object)?;
    if let Some(listener) = parser.next_function() {
        server.emitter.on("connection", listener.clone());
    }
    guest.set(&object, "listening", guest.boolean(false))?;

    let srv = server.clone();
    guest.set_function(&object, "listen", move |guest, this, args| {
        srv.listen(guest, this, args)?;
        Ok(this.clone())
    })?;

    let srv = server.clone();
    guest.set_function(&object, "close", move |_guest, this, args| {
        srv.close(ArgParser::new(args).trailing_function().cloned());
        Ok(this.clone())
    })?;

    let srv = server;
    guest.set_function(&object, "address", move |guest, _this, _args| match srv.local.get() {
        Some(addr) => address_info(guest, &addr),
        None => Ok(guest.null()),
    })?;

    for name in ["ref", "unref"] {
        guest.set_function(&object, name, |_guest, this, _args| Ok(this.clone()))?;
    }
    Ok(object)
}

/// Create a client socket for `transport` and start connecting it.
pub(crate) fn connect<G: Guest>(
    ctx: &Rc<NodeContext<G>>,
    guest: &G,
    transport: Transport,
    args: &[G::Value],
) -> GuestResult<G::Value, G::Value> {
    let (options, listener) = connect_args(guest, args)?;
    let guest = ctx.guest()?;
    let (object, socket) = Socket::create(ctx, &guest, transport)?;
    socket.connect(ctx, guest.as_ref(), &object, options, listener)?;
    Ok(object)
}

/// Exports of `require('net')`.
pub fn module<G: Guest>(ctx: &Rc<NodeContext<G>>, guest: &G) -> GuestResult<G::Value, G::Value> {
    let exports = guest.object();

    for name in ["connect", "createConnection"] {
        let ctx = ctx.clone();
        guest.set_function(&exports, name, move |guest, _this, args| {
            connect(&ctx, guest, Transport::Tcp, args)
        })?;
    }

    let context = ctx.clone();
    guest.set_function(&exports, "createServer", move |_guest, _this, args| {
        let guest = context.guest()?;
        create_server(&context, &guest, args)
    })?;

    let context = ctx.clone();
    guest.set_function(&exports, "Socket", move |_guest, _this, args| {
        let guest = context.guest()?;
        let (object, socket) = Socket::create(&context, &guest, Transport::Tcp)?;
        if let Some(value) = ArgParser::new(args).next_object() {
            let parsed = options::parse::<G, ConnectOptions>(guest.as_ref(), value, "socket")?;
            socket.no_delay.set(parsed.no_delay);
        }
        Ok(object)
    })?;

    for (name, accept) in [("isIP", None), ("isIPv4", Some(4)), ("isIPv6", Some(6))] {
        guest.set_function(&exports, name, move |guest, _this, args| {
            let input = args.first().and_then(|v| guest.as_string(v)).unwrap_or_default();
            let version = ip_version(&input);
            Ok(match accept {
                None => guest.number(f64::from(version)),
                Some(wanted) => guest.boolean(version == wanted),
            })
        })?;
    }

    Ok(exports)
}
