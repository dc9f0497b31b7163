//! Proxy server runtime
//!
//! Accepts clients and runs one [`ConnectionHandler`] per client. The handler feeds socket
//! events into the layer stack and executes the commands that come back.

use crate::commands::{Command, CommandKind};
use crate::connection::{Address, Connection, ConnectionId, ConnectionRef, ConnectionState, Role, TransportProtocol};
use crate::context::Context;
use crate::error::ProxyError;
use crate::events::Event;
use crate::hooks::{Hook, ServerConnectionData};
use crate::layer::Layer;
use crate::layers::modes::{ReverseProxy, TransparentProxy};
use crate::options::{Options, ProxyMode};
use crate::proxy::addons::Addons;
use crate::proxy::cert_manager::CertManager;
use anyhow::Context as _;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Level;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const MAX_DATAGRAM_SIZE: usize = 65_535;
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Proxy server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address
    pub bind_address: String,
    /// Port to listen on. 0 picks a free port.
    pub port: u16,
    /// Also accept UDP clients on the same port.
    pub udp: bool,
    /// CA and log storage root
    pub storage_path: PathBuf,
    pub options: Options,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            udp: false,
            storage_path: PathBuf::from("./layerproxy"),
            options: Options::default(),
        }
    }
}

impl ProxyConfig {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// What every handler shares.
struct Runtime {
    options: Arc<Options>,
    addons: Addons,
}

/// A bound, not yet running proxy.
pub struct ProxyServer {
    tcp: TcpListener,
    udp: Option<Arc<UdpSocket>>,
    runtime: Arc<Runtime>,
    cert_manager: Arc<CertManager>,
}

impl ProxyServer {
    /// Binds the listeners and sets up the standard addons.
    pub async fn bind(config: ProxyConfig) -> anyhow::Result<Self> {
        let cert_manager = Arc::new(CertManager::new(&config.storage_path)?);
        let addons = Addons::standard(&config.options, cert_manager.clone())?;
        Self::bind_with_addons(config, cert_manager, addons).await
    }

    pub async fn bind_with_addons(
        config: ProxyConfig,
        cert_manager: Arc<CertManager>,
        addons: Addons,
    ) -> anyhow::Result<Self> {
        let addr = config.listen_address();
        let tcp = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let udp = if config.udp {
            let local = tcp.local_addr()?;
            let socket = UdpSocket::bind(local)
                .await
                .with_context(|| format!("Failed to bind UDP {}", local))?;
            Some(Arc::new(socket))
        } else {
            None
        };
        Ok(Self {
            tcp,
            udp,
            runtime: Arc::new(Runtime {
                options: Arc::new(config.options),
                addons,
            }),
            cert_manager,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn cert_manager(&self) -> &Arc<CertManager> {
        &self.cert_manager
    }

    /// Accepts clients until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tracing::info!(
            "Proxy server listening on {} ({} mode)",
            self.tcp.local_addr()?,
            self.runtime.options.mode.name()
        );
        let udp_task = self
            .udp
            .clone()
            .map(|socket| tokio::spawn(serve_udp(socket, self.runtime.clone())));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.tcp.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        tracing::debug!("Connection from {}", peer_addr);
                        let runtime = self.runtime.clone();
                        tokio::spawn(async move {
                            match ConnectionHandler::tcp(socket, runtime) {
                                Ok(handler) => handler.run().await,
                                Err(e) => tracing::debug!("Dropping client {}: {}", peer_addr, e),
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }

        if let Some(task) = udp_task {
            task.abort();
        }
        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

/// Run the proxy server until Ctrl-C.
pub async fn run_server(config: ProxyConfig) -> anyhow::Result<()> {
    let server = ProxyServer::bind(config).await?;
    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

type UdpPeers = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Message>>>>;

/// UDP has no accept: the first datagram from a new peer starts its handler.
async fn serve_udp(socket: Arc<UdpSocket>, runtime: Arc<Runtime>) {
    let peers: UdpPeers = Arc::default();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!("UDP receive error: {}", e);
                continue;
            }
        };
        let data = Bytes::copy_from_slice(&buf[..n]);

        let existing = peers.lock().get(&peer).cloned();
        if let Some(tx) = existing {
            if tx.send(Message::Datagram(data.clone())).is_ok() {
                continue;
            }
        }

        let handler = match ConnectionHandler::udp(socket.clone(), peer, runtime.clone()) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::debug!("Dropping UDP client {}: {}", peer, e);
                continue;
            }
        };
        let tx = handler.tx.clone();
        let _ = tx.send(Message::Datagram(data));
        peers.lock().insert(peer, tx.clone());
        let peers = peers.clone();
        tokio::spawn(async move {
            handler.run().await;
            release_peer(&peers, peer, &tx);
        });
    }
}

/// Forgets `peer` unless a newer handler took its place already.
fn release_peer(peers: &UdpPeers, peer: SocketAddr, tx: &mpsc::UnboundedSender<Message>) {
    let mut peers = peers.lock();
    if peers.get(&peer).is_some_and(|current| current.same_channel(tx)) {
        peers.remove(&peer);
    }
}

enum Message {
    Event(Event),
    /// A datagram for the UDP client.
    Datagram(Bytes),
    Opened {
        command: Command,
        connection: ConnectionRef,
        result: Result<Endpoint, ProxyError>,
    },
}

enum Endpoint {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

enum Writer {
    Tcp(OwnedWriteHalf),
    /// A connected socket towards a server.
    Udp(Arc<UdpSocket>),
    /// The shared listening socket, answering one client.
    UdpPeer { socket: Arc<UdpSocket>, peer: SocketAddr },
}

impl Writer {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Writer::Tcp(w) => w.write_all(data).await,
            Writer::Udp(socket) => socket.send(data).await.map(|_| ()),
            Writer::UdpPeer { socket, peer } => socket.send_to(data, *peer).await.map(|_| ()),
        }
    }

    async fn shutdown(&mut self) {
        if let Writer::Tcp(w) = self {
            if let Err(e) = w.shutdown().await {
                tracing::debug!("Shutdown error: {}", e);
            }
        }
    }
}

struct Transport {
    writer: Writer,
    reader: Option<JoinHandle<()>>,
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Runs the layer stack of one client connection.
pub struct ConnectionHandler {
    client: ConnectionRef,
    peer: String,
    runtime: Arc<Runtime>,
    layer: Box<dyn Layer>,
    transports: HashMap<ConnectionId, Transport>,
    opening: usize,
    pending: VecDeque<Event>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl ConnectionHandler {
    fn tcp(stream: TcpStream, runtime: Arc<Runtime>) -> Result<Self, ProxyError> {
        let peername = stream.peer_addr()?;
        let sockname = stream.local_addr()?;
        let (read, write) = stream.into_split();
        let mut handler = Self::new(peername, sockname, TransportProtocol::Tcp, runtime);
        let reader = spawn_tcp_reader(handler.client.clone(), read, handler.tx.clone());
        handler.transports.insert(
            handler.client.id(),
            Transport {
                writer: Writer::Tcp(write),
                reader: Some(reader),
            },
        );
        Ok(handler)
    }

    fn udp(socket: Arc<UdpSocket>, peer: SocketAddr, runtime: Arc<Runtime>) -> Result<Self, ProxyError> {
        let sockname = socket.local_addr()?;
        let mut handler = Self::new(peer, sockname, TransportProtocol::Udp, runtime);
        handler.transports.insert(
            handler.client.id(),
            Transport {
                writer: Writer::UdpPeer { socket, peer },
                reader: None,
            },
        );
        Ok(handler)
    }

    fn new(
        peername: SocketAddr,
        sockname: SocketAddr,
        transport: TransportProtocol,
        runtime: Arc<Runtime>,
    ) -> Self {
        let mut client = Connection::client(peername.into(), sockname.into());
        client.transport_protocol = transport;
        client.role = Role::Client {
            proxy_mode: runtime.options.mode.name().to_string(),
        };
        let client = ConnectionRef::new(client);

        let context = Context::new(client.clone(), runtime.options.clone());
        {
            let mut server = context.server.lock();
            server.transport_protocol = transport;
            if let ProxyMode::Transparent { .. } = runtime.options.mode {
                // No original destination lookup: the address the client reached is the target.
                let _ = server.set_address(Some(sockname.into()));
            }
        }
        let layer: Box<dyn Layer> = match runtime.options.mode {
            ProxyMode::Reverse { .. } => Box::new(ReverseProxy::layer(context)),
            ProxyMode::Transparent { .. } => Box::new(TransparentProxy::layer(context)),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            client,
            peer: peername.to_string(),
            runtime,
            layer,
            transports: HashMap::new(),
            opening: 0,
            pending: VecDeque::new(),
            tx,
            rx,
        }
    }

    pub async fn run(mut self) {
        self.runtime
            .addons
            .dispatch(&Hook::ClientConnected(self.client.clone()));
        let vetoed = self.client.lock().error.clone();
        if let Some(err) = vetoed {
            tracing::info!(peer = %self.peer, "Client rejected: {}", err);
            self.teardown();
            return;
        }

        self.feed(Event::Start).await;
        while !self.finished() {
            let message = if self.client.lock().transport_protocol == TransportProtocol::Udp {
                match tokio::time::timeout(UDP_IDLE_TIMEOUT, self.rx.recv()).await {
                    Ok(message) => message,
                    Err(_) if self.client.state().is_closed() => {
                        // Idle again after the client went away: drop what is left.
                        self.transports.clear();
                        continue;
                    }
                    Err(_) => Some(Message::Event(Event::closed(&self.client))),
                }
            } else {
                self.rx.recv().await
            };
            let Some(message) = message else {
                break;
            };
            self.handle_message(message).await;
        }
        self.teardown();
    }

    fn finished(&self) -> bool {
        self.client.state().is_closed() && self.transports.is_empty() && self.opening == 0
    }

    fn teardown(&mut self) {
        self.transports.clear();
        {
            let mut client = self.client.lock();
            client.state = ConnectionState::CLOSED;
            client.timestamp_end.get_or_insert_with(Utc::now);
        }
        self.runtime
            .addons
            .dispatch(&Hook::ClientDisconnected(self.client.clone()));
        tracing::debug!(peer = %self.peer, "Client disconnected");
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Event(event) => {
                if let Some(conn) = event.connection() {
                    if !self.transports.contains_key(&conn.id()) {
                        // Late reads of a connection we already closed.
                        return;
                    }
                }
                if let Event::ConnectionClosed { connection } = &event {
                    self.peer_closed(connection);
                }
                self.feed(event).await;
            }
            Message::Datagram(data) => {
                if self.client.state().contains(ConnectionState::CAN_READ) {
                    let event = Event::data(&self.client, data);
                    self.feed(event).await;
                }
            }
            Message::Opened {
                command,
                connection,
                result,
            } => {
                self.opening -= 1;
                self.opened(command, connection, result);
                self.drain().await;
            }
        }
    }

    /// The peer will send no more data.
    fn peer_closed(&mut self, connection: &ConnectionRef) {
        let closed = {
            let mut conn = connection.lock();
            conn.state = if conn.transport_protocol == TransportProtocol::Udp {
                ConnectionState::CLOSED
            } else {
                conn.state.without(ConnectionState::CAN_READ)
            };
            conn.state.is_closed()
        };
        if closed {
            self.forget(connection);
        }
    }

    fn forget(&mut self, connection: &ConnectionRef) {
        connection.lock().timestamp_end.get_or_insert_with(Utc::now);
        if self.transports.remove(&connection.id()).is_some() && !connection.is_client() {
            self.runtime
                .addons
                .dispatch(&Hook::ServerDisconnected(ServerConnectionData {
                    client: self.client.clone(),
                    server: connection.clone(),
                }));
        }
    }

    async fn feed(&mut self, event: Event) {
        self.pending.push_back(event);
        self.drain().await;
    }

    async fn drain(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            let commands = self.layer.handle_event(event);
            for command in commands {
                self.execute(command).await;
            }
        }
    }

    async fn execute(&mut self, command: Command) {
        match command.kind.clone() {
            CommandKind::SendData { connection, data } => {
                let Some(transport) = self.transports.get_mut(&connection.id()) else {
                    tracing::debug!(peer = %self.peer, "Dropping data for closed {}", connection);
                    return;
                };
                if let Err(e) = transport.writer.write(&data).await {
                    tracing::debug!(peer = %self.peer, "Write to {} failed: {}", connection, e);
                }
            }
            CommandKind::OpenConnection { connection } => self.open(command, connection),
            CommandKind::CloseConnection {
                connection,
                half_close,
            } => {
                self.close(&connection, half_close).await;
                self.complete(command, None);
            }
            CommandKind::CloseQuicConnection { connection, .. } => {
                self.close(&connection, false).await;
                self.complete(command, None);
            }
            CommandKind::SendQuicStreamData { .. }
            | CommandKind::ResetQuicStream { .. }
            | CommandKind::StopSendingQuicStream { .. } => {
                tracing::warn!(peer = %self.peer, "Unhandled stream command: {}", command);
            }
            CommandKind::Log { message, level } => log(&self.peer, level, &message),
            CommandKind::Hook(hook) => {
                self.runtime.addons.dispatch(&hook);
                if command.is_blocking() {
                    self.complete(command, None);
                }
            }
            CommandKind::RequestWakeup { delay } => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Message::Event(Event::completed(command, None)));
                });
            }
        }
    }

    fn complete(&mut self, command: Command, reply: Option<String>) {
        if command.is_blocking() {
            self.pending.push_back(Event::completed(command, reply));
        }
    }

    async fn close(&mut self, connection: &ConnectionRef, half_close: bool) {
        let udp = connection.lock().transport_protocol == TransportProtocol::Udp;
        if half_close && !udp {
            if !connection.state().contains(ConnectionState::CAN_WRITE) {
                return;
            }
            if let Some(transport) = self.transports.get_mut(&connection.id()) {
                transport.writer.shutdown().await;
            }
            let closed = {
                let mut conn = connection.lock();
                conn.state = conn.state.without(ConnectionState::CAN_WRITE);
                conn.state.is_closed()
            };
            if closed {
                self.forget(connection);
            }
            return;
        }
        if let Some(transport) = self.transports.get_mut(&connection.id()) {
            transport.writer.shutdown().await;
        }
        connection.set_state(ConnectionState::CLOSED);
        self.forget(connection);
    }

    fn open(&mut self, command: Command, connection: ConnectionRef) {
        let data = ServerConnectionData {
            client: self.client.clone(),
            server: connection.clone(),
        };
        self.runtime.addons.dispatch(&Hook::ServerConnect(data));

        let (target, transport, vetoed) = {
            let mut conn = connection.lock();
            conn.timestamp_start = Some(Utc::now());
            (conn.address().cloned(), conn.transport_protocol, conn.error.clone())
        };
        if let Some(err) = vetoed {
            self.failed(command, connection, err);
            return;
        }
        let Some(target) = target else {
            let err = ProxyError::NoAddress(connection.to_string()).to_string();
            self.failed(command, connection, err);
            return;
        };

        let timeout = Duration::from_secs(self.runtime.options.connect_timeout_secs);
        let tx = self.tx.clone();
        self.opening += 1;
        tokio::spawn(async move {
            let result = connect(&target, transport, timeout).await;
            let _ = tx.send(Message::Opened {
                command,
                connection,
                result,
            });
        });
    }

    fn opened(&mut self, command: Command, connection: ConnectionRef, result: Result<Endpoint, ProxyError>) {
        let endpoint = match result {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.failed(command, connection, e.to_string());
                return;
            }
        };
        let (peername, sockname, transport) = match endpoint {
            Endpoint::Tcp(stream) => {
                let names = (stream.peer_addr().ok(), stream.local_addr().ok());
                let (read, write) = stream.into_split();
                let reader = spawn_tcp_reader(connection.clone(), read, self.tx.clone());
                let transport = Transport {
                    writer: Writer::Tcp(write),
                    reader: Some(reader),
                };
                (names.0, names.1, transport)
            }
            Endpoint::Udp(socket) => {
                let names = (socket.peer_addr().ok(), socket.local_addr().ok());
                let socket = Arc::new(socket);
                let reader = spawn_udp_reader(connection.clone(), socket.clone(), self.tx.clone());
                let transport = Transport {
                    writer: Writer::Udp(socket),
                    reader: Some(reader),
                };
                (names.0, names.1, transport)
            }
        };
        {
            let mut conn = connection.lock();
            conn.peername = peername.map(Address::from);
            conn.sockname = sockname.map(Address::from);
            conn.state = ConnectionState::OPEN;
            conn.set_timestamp_tcp_setup(Utc::now());
        }
        self.transports.insert(connection.id(), transport);
        tracing::debug!(peer = %self.peer, "Connected to {}", connection);
        self.runtime
            .addons
            .dispatch(&Hook::ServerConnected(ServerConnectionData {
                client: self.client.clone(),
                server: connection,
            }));
        self.complete(command, None);
    }

    fn failed(&mut self, command: Command, connection: ConnectionRef, err: String) {
        tracing::info!(peer = %self.peer, "Cannot connect to {}: {}", connection, err);
        connection.lock().error = Some(err.clone());
        self.runtime
            .addons
            .dispatch(&Hook::ServerConnectError(ServerConnectionData {
                client: self.client.clone(),
                server: connection,
            }));
        self.complete(command, Some(err));
    }
}

async fn connect(target: &Address, transport: TransportProtocol, timeout: Duration) -> Result<Endpoint, ProxyError> {
    let attempt = async {
        match transport {
            TransportProtocol::Tcp => {
                let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
                stream.set_nodelay(true)?;
                Ok(Endpoint::Tcp(stream))
            }
            TransportProtocol::Udp => {
                let addr = tokio::net::lookup_host((target.host.as_str(), target.port))
                    .await?
                    .next()
                    .ok_or_else(|| ProxyError::NoAddress(target.to_string()))?;
                let bind: SocketAddr = if addr.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(addr).await?;
                Ok(Endpoint::Udp(socket))
            }
        }
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::ConnectTimeout {
            address: target.to_string(),
        }),
    }
}

fn spawn_tcp_reader(
    connection: ConnectionRef,
    mut read: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let event = Event::data(&connection, Bytes::copy_from_slice(&buf[..n]));
                    if tx.send(Message::Event(event)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // Resets and broken pipes are how peers usually leave.
                    tracing::debug!("Read from {} failed: {}", connection, e);
                    break;
                }
            }
        }
        let _ = tx.send(Message::Event(Event::closed(&connection)));
    })
}

fn spawn_udp_reader(
    connection: ConnectionRef,
    socket: Arc<UdpSocket>,
    tx: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv(&mut buf).await {
                Ok(n) => {
                    let event = Event::data(&connection, Bytes::copy_from_slice(&buf[..n]));
                    if tx.send(Message::Event(event)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!("Receive from {} failed: {}", connection, e);
                    break;
                }
            }
        }
        let _ = tx.send(Message::Event(Event::closed(&connection)));
    })
}

/// Re-emits a layer's log line through `tracing`.
fn log(peer: &str, level: Level, message: &str) {
    match level {
        Level::ERROR => tracing::error!(peer, "{}", message),
        Level::WARN => tracing::warn!(peer, "{}", message),
        Level::INFO => tracing::info!(peer, "{}", message),
        Level::DEBUG => tracing::debug!(peer, "{}", message),
        _ => tracing::trace!(peer, "{}", message),
    }
}
