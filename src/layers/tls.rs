//! TLS termination
//!
//! [`ClientTls`] and [`ServerTls`] are tunnels whose outer and inner connection are the same
//! endpoint: ciphertext flows on the wire, plaintext flows to and from the child layer. The
//! actual TLS engine sits behind [`TlsSession`]; addons provide one through the
//! `tls_start_client` / `tls_start_server` hooks.

use crate::commands::{Command, CommandKind, Reply};
use crate::connection::{Certificate, ConnectionRef, ConnectionState};
use crate::context::Context;
use crate::error::TlsError;
use crate::events::Event;
use crate::hooks::{shared, Hook, Shared};
use crate::layer::{Commands, Engine, Step};
use crate::tunnel::{Handshake, Tunnel, TunnelLayer, TunnelState};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use rustls::server::Acceptor;
use rustls::{AlertDescription, ClientConfig, ProtocolVersion, ServerConfig};
use std::io::{self, Read, Write};
use std::mem;
use std::sync::Arc;
use tracing::Level;

/// The sans-IO surface of a TLS engine.
pub trait TlsSession: Send {
    /// Feeds ciphertext received from the peer.
    fn receive_ciphertext(&mut self, data: &[u8]) -> Result<(), TlsError>;

    /// Ciphertext waiting to be sent to the peer.
    fn take_ciphertext(&mut self) -> Vec<u8>;

    /// Decrypted application data received so far.
    fn read_plaintext(&mut self) -> Result<Vec<u8>, TlsError>;

    fn write_plaintext(&mut self, data: &[u8]) -> Result<(), TlsError>;

    fn send_close_notify(&mut self);

    fn is_handshaking(&self) -> bool;

    /// True once the peer sent close_notify.
    fn peer_closed(&self) -> bool;

    fn alpn(&self) -> Option<Vec<u8>>;

    fn cipher(&self) -> Option<String>;

    fn version(&self) -> Option<String>;

    fn peer_certificates(&self) -> Vec<Certificate>;
}

/// [`TlsSession`] backed by rustls.
pub struct RustlsSession {
    conn: rustls::Connection,
    plaintext: Vec<u8>,
    /// Records pulled out of rustls early to make room for more plaintext.
    ciphertext: Vec<u8>,
    peer_closed: bool,
}

impl RustlsSession {
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let conn = rustls::ServerConnection::new(config)?;
        Ok(Self::from_connection(conn.into()))
    }

    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| TlsError::Config(format!("invalid server name {}: {}", server_name, e)))?;
        let conn = rustls::ClientConnection::new(config, name)?;
        Ok(Self::from_connection(conn.into()))
    }

    fn from_connection(conn: rustls::Connection) -> Self {
        Self {
            conn,
            plaintext: Vec::new(),
            ciphertext: Vec::new(),
            peer_closed: false,
        }
    }

    fn pull_ciphertext(&mut self) {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.ciphertext) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    fn drain_plaintext(&mut self) -> Result<(), TlsError> {
        match self.conn.reader().read_to_end(&mut self.plaintext) {
            Ok(_) => self.peer_closed = true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

impl TlsSession for RustlsSession {
    fn receive_ciphertext(&mut self, mut data: &[u8]) -> Result<(), TlsError> {
        while !data.is_empty() {
            self.conn.read_tls(&mut data)?;
            self.conn.process_new_packets()?;
            // Keeps rustls' plaintext buffer from filling up on large bursts.
            self.drain_plaintext()?;
        }
        Ok(())
    }

    fn take_ciphertext(&mut self) -> Vec<u8> {
        self.pull_ciphertext();
        mem::take(&mut self.ciphertext)
    }

    fn read_plaintext(&mut self) -> Result<Vec<u8>, TlsError> {
        self.drain_plaintext()?;
        Ok(mem::take(&mut self.plaintext))
    }

    fn write_plaintext(&mut self, mut data: &[u8]) -> Result<(), TlsError> {
        while !data.is_empty() {
            let written = self.conn.writer().write(data)?;
            if written == 0 {
                // rustls' send buffer is full. Encrypted records move out and free it up.
                let before = self.ciphertext.len();
                self.pull_ciphertext();
                if self.ciphertext.len() == before {
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                continue;
            }
            data = &data[written..];
        }
        Ok(())
    }

    fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    fn alpn(&self) -> Option<Vec<u8>> {
        self.conn.alpn_protocol().map(|p| p.to_vec())
    }

    fn cipher(&self) -> Option<String> {
        self.conn
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }

    fn version(&self) -> Option<String> {
        self.conn.protocol_version().map(|version| match version {
            ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
            ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
            other => format!("{:?}", other),
        })
    }

    fn peer_certificates(&self) -> Vec<Certificate> {
        self.conn
            .peer_certificates()
            .map(|certs| {
                certs
                    .iter()
                    .map(|cert| Certificate(cert.as_ref().to_vec()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The parts of a ClientHello the proxy cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub sni: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub cipher_suites: Vec<String>,
}

/// Parses a ClientHello from the start of a TLS byte stream.
///
/// Returns `Ok(None)` while the message is incomplete.
pub fn parse_client_hello(data: &[u8]) -> Result<Option<ClientHello>, TlsError> {
    let mut acceptor = Acceptor::default();
    let mut rd = data;
    while !rd.is_empty() {
        if acceptor.read_tls(&mut rd)? == 0 {
            break;
        }
    }
    let accepted = match acceptor.accept() {
        Ok(Some(accepted)) => accepted,
        Ok(None) => return Ok(None),
        Err((err, _alert)) => return Err(err.into()),
    };
    let hello = accepted.client_hello();
    Ok(Some(ClientHello {
        sni: hello.server_name().map(str::to_string),
        alpn_protocols: hello
            .alpn()
            .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
            .unwrap_or_default(),
        cipher_suites: hello
            .cipher_suites()
            .iter()
            .map(|suite| format!("{:?}", suite))
            .collect(),
    }))
}

/// Payload of the `tls_clienthello` hook.
#[derive(Clone)]
pub struct ClientHelloData {
    pub context: Context,
    pub client_hello: ClientHello,
    /// Connect and finish TLS with the server before answering the client.
    pub establish_server_tls_first: bool,
}

/// Payload of the TLS lifecycle hooks. Start hooks expect `session` to be filled in.
pub struct TlsData {
    pub conn: ConnectionRef,
    pub context: Context,
    pub session: Option<Box<dyn TlsSession>>,
}

impl TlsData {
    pub fn new(conn: &ConnectionRef, context: &Context) -> Self {
        Self {
            conn: conn.clone(),
            context: context.clone(),
            session: None,
        }
    }
}

#[derive(Default)]
struct TlsCore {
    session: Option<Box<dyn TlsSession>>,
    close_dispatched: bool,
}

trait TlsSide: Tunnel {
    fn core(&mut self) -> &mut TlsCore;
}

fn is_client<P: TlsSide>(t: &TunnelLayer<P>) -> bool {
    t.conn == t.context.client
}

fn debug_log<P: TlsSide>(t: &TunnelLayer<P>, out: &mut Commands, message: String) {
    if t.context.options.proxy_debug {
        out.push(Command::log(message, Level::DEBUG));
    }
}

fn lifecycle_hook(client: bool, data: Shared<TlsData>, kind: HookKind) -> Hook {
    match (kind, client) {
        (HookKind::Start, true) => Hook::TlsStartClient(data),
        (HookKind::Start, false) => Hook::TlsStartServer(data),
        (HookKind::Established, true) => Hook::TlsEstablishedClient(data),
        (HookKind::Established, false) => Hook::TlsEstablishedServer(data),
        (HookKind::Failed, true) => Hook::TlsFailedClient(data),
        (HookKind::Failed, false) => Hook::TlsFailedServer(data),
    }
}

#[derive(Clone, Copy)]
enum HookKind {
    Start,
    Established,
    Failed,
}

fn flush<P: TlsSide>(t: &mut TunnelLayer<P>, out: &mut Commands) {
    let Some(session) = t.proto.core().session.as_mut() else {
        return;
    };
    let bytes = session.take_ciphertext();
    if !bytes.is_empty() {
        out.push(Command::send_data(&t.tunnel_connection, bytes));
    }
}

/// Asks addons for a session. Closes the connection if none is provided.
fn start_tls<P: TlsSide>(t: &mut TunnelLayer<P>, out: &mut Commands) -> Step<TunnelLayer<P>> {
    let data = shared(TlsData::new(&t.conn, &t.context));
    let hook = lifecycle_hook(is_client(t), data.clone(), HookKind::Start);
    Step::emit(Command::hook(hook), out).then(t, out, move |this: &mut TunnelLayer<P>, out, _| {
        let session = data.lock().session.take();
        match session {
            Some(session) => {
                this.proto.core().session = Some(session);
                Step::done()
            }
            None => {
                out.push(Command::log(
                    "No TLS context was provided, failing connection.",
                    Level::ERROR,
                ));
                Step::emit(Command::close_connection(&this.conn), out).map(|_| ())
            }
        }
    })
}

fn handshake<P: TlsSide>(
    t: &mut TunnelLayer<P>,
    data: Bytes,
    out: &mut Commands,
) -> Step<TunnelLayer<P>, Handshake> {
    let Some(session) = t.proto.core().session.as_mut() else {
        return Step::Ready((false, Some("connection closed early".to_string())));
    };
    let received = session.receive_ciphertext(&data);
    let handshaking = session.is_handshaking();
    flush(t, out);
    if let Err(err) = received {
        return Step::Ready((false, Some(describe_error(&err, &data))));
    }
    if handshaking {
        return Step::Ready((false, None));
    }
    established(t, out)
}

/// Records what was negotiated and tells addons.
fn established<P: TlsSide>(
    t: &mut TunnelLayer<P>,
    out: &mut Commands,
) -> Step<TunnelLayer<P>, Handshake> {
    if let Some(session) = t.proto.core().session.as_ref() {
        let mut conn = t.conn.lock();
        conn.timestamp_tls_setup = Some(Utc::now());
        conn.alpn = session.alpn();
        conn.certificate_list = session.peer_certificates();
        conn.cipher = session.cipher();
        conn.tls_version = session.version();
    }
    debug_log(t, out, format!("[tls] tls established: {}", t.conn));
    let data = shared(TlsData::new(&t.conn, &t.context));
    let hook = lifecycle_hook(is_client(t), data, HookKind::Established);
    Step::emit(Command::hook(hook), out).then(t, out, |this: &mut TunnelLayer<P>, out, _| {
        receive_data(this, Bytes::new(), out).map(|()| (true, None))
    })
}

fn receive_data<P: TlsSide>(
    t: &mut TunnelLayer<P>,
    data: Bytes,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    let (plaintext, error, peer_closed) = match t.proto.core().session.as_mut() {
        Some(session) => {
            let mut error = session.receive_ciphertext(&data).err();
            let plaintext = session.read_plaintext().unwrap_or_else(|e| {
                error.get_or_insert(e);
                Vec::new()
            });
            (plaintext, error, session.peer_closed())
        }
        None => return Step::done(),
    };
    flush(t, out);
    if let Some(err) = error {
        // Typically an alert after a completed handshake, e.g. a client rejecting the certificate late.
        out.push(Command::log(format!("TLS Error: {}", err), Level::WARN));
    }
    let close = peer_closed && !t.proto.core().close_dispatched;

    let step = if plaintext.is_empty() {
        Step::done()
    } else {
        let event = Event::data(&t.conn, plaintext);
        t.event_to_child(event, out)
    };
    step.then(t, out, move |this: &mut TunnelLayer<P>, out, ()| {
        if !close {
            return Step::done();
        }
        this.proto.core().close_dispatched = true;
        {
            let mut conn = this.conn.lock();
            conn.state = conn.state.without(ConnectionState::CAN_READ);
        }
        debug_log(this, out, format!("[tls] close_notify {}", this.conn));
        let event = Event::closed(&this.conn);
        this.event_to_child(event, out)
    })
}

fn receive_close<P: TlsSide>(t: &mut TunnelLayer<P>, out: &mut Commands) -> Step<TunnelLayer<P>> {
    if t.proto.core().close_dispatched {
        // The child already saw the close_notify.
        return Step::done();
    }
    let event = Event::closed(&t.conn);
    t.event_to_child(event, out)
}

fn send_data<P: TlsSide>(t: &mut TunnelLayer<P>, data: Bytes, out: &mut Commands) -> Step<TunnelLayer<P>> {
    let result = match t.proto.core().session.as_mut() {
        Some(session) => session.write_plaintext(&data),
        None => Ok(()),
    };
    flush(t, out);
    match result {
        Ok(()) => Step::done(),
        Err(err) => {
            out.push(Command::log(
                format!("TLS Error: cannot send {} bytes to {}: {}", data.len(), t.conn, err),
                Level::WARN,
            ));
            Step::emit(Command::close_connection(&t.tunnel_connection), out).map(|_| ())
        }
    }
}

fn send_close<P: TlsSide>(
    t: &mut TunnelLayer<P>,
    command: Command,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    if let Some(session) = t.proto.core().session.as_mut() {
        session.send_close_notify();
    }
    flush(t, out);
    out.push(command);
    Step::done()
}

fn handshake_failed<P: TlsSide>(
    t: &mut TunnelLayer<P>,
    err: String,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    t.conn.lock().error = Some(err);
    let data = shared(TlsData::new(&t.conn, &t.context));
    let hook = lifecycle_hook(is_client(t), data, HookKind::Failed);
    Step::emit(Command::hook(hook), out).then(t, out, |this: &mut TunnelLayer<P>, out, _| {
        Step::emit(Command::close_connection(&this.tunnel_connection), out).map(|_| ())
    })
}

fn describe_error(err: &TlsError, data: &[u8]) -> String {
    match err {
        TlsError::Protocol(rustls::Error::InvalidCertificate(reason)) => {
            format!("Certificate verify failed: {:?}", reason)
        }
        TlsError::Protocol(rustls::Error::AlertReceived(AlertDescription::ProtocolVersion)) => {
            "The remote server and the proxy cannot agree on a TLS version to use.".to_string()
        }
        TlsError::Protocol(rustls::Error::InvalidMessage(_))
            if data.len() >= 4 && data[..4].is_ascii() =>
        {
            "The remote server does not speak TLS.".to_string()
        }
        other => other.to_string(),
    }
}

/// TLS towards a server. Usually the server connection of the context.
pub struct ServerTls {
    core: TlsCore,
    wait_for_clienthello: bool,
}

impl ServerTls {
    pub const NAME: &'static str = "ServerTlsLayer";

    pub fn layer(context: Context, conn: Option<ConnectionRef>) -> Engine<TunnelLayer<Self>> {
        let conn = conn.unwrap_or_else(|| context.server.clone());
        conn.lock().tls = true;
        let proto = Self {
            core: TlsCore::default(),
            wait_for_clienthello: false,
        };
        TunnelLayer::new(context, conn.clone(), conn, proto)
    }
}

impl TlsSide for ServerTls {
    fn core(&mut self) -> &mut TlsCore {
        &mut self.core
    }
}

impl Tunnel for ServerTls {
    const NAME: &'static str = ServerTls::NAME;

    fn start_handshake(t: &mut TunnelLayer<Self>, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        // Opened eagerly with client TLS right below: hold off until the ClientHello is known,
        // so SNI and ALPN can be mirrored towards the server.
        if !t.replying_to_command() && t.child.name() == ClientTls::NAME {
            t.proto.wait_for_clienthello = true;
            t.tunnel_state = TunnelState::Closed;
            return Step::done();
        }
        start_tls(t, out).then(t, out, |this: &mut TunnelLayer<Self>, out, ()| {
            if this.proto.core.session.is_none() {
                return Step::done();
            }
            handshake(this, Bytes::new(), out).map(|_| ())
        })
    }

    fn receive_handshake_data(
        t: &mut TunnelLayer<Self>,
        data: Bytes,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>, Handshake> {
        handshake(t, data, out)
    }

    fn on_handshake_error(
        t: &mut TunnelLayer<Self>,
        err: String,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        out.push(Command::log(
            format!("Server TLS handshake failed. {}", err),
            Level::WARN,
        ));
        handshake_failed(t, err, out)
    }

    fn receive_data(t: &mut TunnelLayer<Self>, data: Bytes, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        receive_data(t, data, out)
    }

    fn receive_close(t: &mut TunnelLayer<Self>, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        receive_close(t, out)
    }

    fn send_data(t: &mut TunnelLayer<Self>, data: Bytes, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        send_data(t, data, out)
    }

    fn send_close(
        t: &mut TunnelLayer<Self>,
        command: Command,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        send_close(t, command, out)
    }

    fn handle_command(
        t: &mut TunnelLayer<Self>,
        command: Command,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        let opens_us = matches!(command.kind, CommandKind::OpenConnection { .. })
            && command.targets(&t.conn);
        if t.proto.wait_for_clienthello && opens_us {
            // Already connected: the open only tells us the ClientHello is in.
            t.proto.wait_for_clienthello = false;
            return t.establish_for(command, out);
        }
        t.handle_tunnel_command(command, out)
    }
}

/// TLS towards the client.
pub struct ClientTls {
    core: TlsCore,
    recv_buffer: BytesMut,
    server_tls_available: bool,
    client_hello_parsed: bool,
    errored: bool,
}

impl ClientTls {
    pub const NAME: &'static str = "ClientTlsLayer";

    pub fn layer(context: Context) -> Engine<TunnelLayer<Self>> {
        {
            let mut client = context.client.lock();
            if client.tls {
                // TLS over TLS: only the innermost session is kept on the client.
                client.alpn = None;
                client.cipher = None;
                client.sni = None;
                client.timestamp_tls_setup = None;
                client.tls_version = None;
                client.certificate_list.clear();
                client.alpn_offers.clear();
                client.cipher_list.clear();
            }
            client.tls = true;
        }
        let proto = Self {
            core: TlsCore::default(),
            recv_buffer: BytesMut::new(),
            server_tls_available: context.layers.last_name() == Some(ServerTls::NAME),
            client_hello_parsed: false,
            errored: false,
        };
        let client = context.client.clone();
        TunnelLayer::new(context, client.clone(), client, proto)
    }

    fn start_server_tls(t: &mut TunnelLayer<Self>, out: &mut Commands) -> Step<TunnelLayer<Self>, Reply> {
        if !t.proto.server_tls_available {
            return Step::Ready(Some("No server TLS available.".to_string()));
        }
        let server = t.context.server.clone();
        Step::emit(Command::open_connection(&server), out)
    }
}

impl TlsSide for ClientTls {
    fn core(&mut self) -> &mut TlsCore {
        &mut self.core
    }
}

impl Tunnel for ClientTls {
    const NAME: &'static str = ClientTls::NAME;

    fn start_handshake(_t: &mut TunnelLayer<Self>, _out: &mut Commands) -> Step<TunnelLayer<Self>> {
        Step::done()
    }

    fn receive_handshake_data(
        t: &mut TunnelLayer<Self>,
        data: Bytes,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>, Handshake> {
        if t.proto.client_hello_parsed {
            return handshake(t, data, out);
        }
        t.proto.recv_buffer.extend_from_slice(&data);
        let client_hello = match parse_client_hello(&t.proto.recv_buffer) {
            Ok(Some(client_hello)) => client_hello,
            Ok(None) => return Step::Ready((false, None)),
            Err(_) => {
                let hex: String = t.proto.recv_buffer.iter().map(|b| format!("{:02x}", b)).collect();
                return Step::Ready((false, Some(format!("Cannot parse ClientHello: {}", hex))));
            }
        };
        t.proto.client_hello_parsed = true;
        {
            let mut conn = t.conn.lock();
            conn.sni = client_hello.sni.clone();
            conn.alpn_offers = client_hello.alpn_protocols.clone();
            conn.cipher_list = client_hello.cipher_suites.clone();
        }
        let data = shared(ClientHelloData {
            context: t.context.clone(),
            client_hello,
            establish_server_tls_first: false,
        });

        Step::emit(Command::hook(Hook::TlsClientHello(data.clone())), out)
            .then(t, out, move |this: &mut TunnelLayer<Self>, out, _| {
                let server_first = data.lock().establish_server_tls_first
                    && !this.context.server.lock().tls_established();
                if server_first {
                    ClientTls::start_server_tls(this, out)
                } else {
                    Step::Ready(None)
                }
            })
            .then(t, out, |this: &mut TunnelLayer<Self>, out, err| {
                if let Some(err) = err {
                    out.push(Command::log(
                        format!(
                            "Unable to establish TLS connection with server ({}). Trying to establish TLS \
                             with client anyway. If you plan to redirect requests away from this server, \
                             consider setting `connection_strategy` to `lazy` to suppress early connections.",
                            err
                        ),
                        Level::INFO,
                    ));
                }
                start_tls(this, out)
            })
            .then(t, out, |this: &mut TunnelLayer<Self>, out, ()| {
                if this.proto.core.session.is_none() || !this.conn.connected() {
                    return Step::Ready((false, Some("connection closed early".to_string())));
                }
                let buffered = this.proto.recv_buffer.split().freeze();
                handshake(this, buffered, out)
            })
    }

    fn on_handshake_error(
        t: &mut TunnelLayer<Self>,
        err: String,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        let dest = {
            let client = t.conn.lock();
            match &client.sni {
                Some(sni) => sni.clone(),
                None => match t.context.server.lock().address() {
                    Some(address) => address.to_string(),
                    None => "<no address>".to_string(),
                },
            }
        };
        let mut level = Level::WARN;
        let err = if err.starts_with("Cannot parse ClientHello") || err == "connection closed early" {
            err
        } else if err.contains("PeerIncompatible") || err.contains("peer is incompatible") {
            format!("Client and the proxy cannot agree on TLS parameters ({})", err)
        } else if ["UnknownCA", "BadCertificate", "CertificateUnknown"]
            .iter()
            .any(|alert| err.contains(alert))
        {
            format!("The client does not trust the proxy's certificate for {} ({})", dest, err)
        } else if err == "connection closed" {
            level = Level::INFO;
            format!(
                "The client disconnected during the handshake. If this happens consistently for {}, \
                 this may indicate that the client does not trust the proxy's certificate.",
                dest
            )
        } else {
            format!("The client may not trust the proxy's certificate for {} ({})", dest, err)
        };
        if err != "connection closed early" {
            out.push(Command::log(format!("Client TLS handshake failed. {}", err), level));
        }
        handshake_failed(t, err, out).then(t, out, |this: &mut TunnelLayer<Self>, _, ()| {
            this.proto.errored = true;
            Step::done()
        })
    }

    fn receive_data(t: &mut TunnelLayer<Self>, data: Bytes, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        receive_data(t, data, out)
    }

    fn receive_close(t: &mut TunnelLayer<Self>, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        receive_close(t, out)
    }

    fn send_data(t: &mut TunnelLayer<Self>, data: Bytes, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        send_data(t, data, out)
    }

    fn send_close(
        t: &mut TunnelLayer<Self>,
        command: Command,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        send_close(t, command, out)
    }

    fn event_to_child(
        t: &mut TunnelLayer<Self>,
        event: Event,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        if t.proto.errored {
            debug_log(t, out, format!("[tls] Swallowing {} as handshake failed.", event));
            return Step::done();
        }
        t.deliver_to_child(event, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Layer;
    use crate::test_utils::{logs, tctx, Recorder};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::RootCertStore;

    fn configs(host: &str) -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let der: CertificateDer<'static> = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![der.clone()], key)
            .unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(der).unwrap();
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        (Arc::new(server), Arc::new(client))
    }

    fn client_hello(config: Arc<ClientConfig>, host: &str) -> (rustls::ClientConnection, Vec<u8>) {
        let mut conn = rustls::ClientConnection::new(config, host.to_string().try_into().unwrap()).unwrap();
        let mut hello = Vec::new();
        conn.write_tls(&mut hello).unwrap();
        (conn, hello)
    }

    fn sent_to(commands: &[Command], conn: &ConnectionRef) -> Vec<u8> {
        commands
            .iter()
            .filter_map(|c| match &c.kind {
                CommandKind::SendData { connection, data } if connection == conn => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn find_hook(commands: &[Command], name: &str) -> Command {
        commands
            .iter()
            .find(|c| matches!(&c.kind, CommandKind::Hook(h) if h.name() == name))
            .cloned()
            .unwrap_or_else(|| panic!("no {} hook in {:?}", name, commands.iter().map(|c| c.to_string()).collect::<Vec<_>>()))
    }

    fn feed(client: &mut rustls::ClientConnection, mut data: &[u8]) {
        while !data.is_empty() {
            client.read_tls(&mut data).unwrap();
            client.process_new_packets().unwrap();
        }
    }

    #[test]
    fn parses_sni_and_alpn() {
        let (_, client_config) = configs("example.com");
        let mut config = (*client_config).clone();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let (_, hello) = client_hello(Arc::new(config), "example.com");

        assert_eq!(parse_client_hello(&hello[..10]).unwrap(), None);
        let parsed = parse_client_hello(&hello).unwrap().unwrap();
        assert_eq!(parsed.sni.as_deref(), Some("example.com"));
        assert_eq!(parsed.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert!(!parsed.cipher_suites.is_empty());

        assert!(parse_client_hello(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").is_err());
    }

    #[test]
    fn client_handshake_completes_and_decrypts() {
        let ctx = tctx();
        let (server_config, client_config) = configs("example.com");
        let (recorder, seen) = Recorder::new(ctx.clone());
        let mut layer = ClientTls::layer(ctx.clone()).with_child(Box::new(recorder));

        assert!(layer.handle_event(Event::Start).is_empty());
        assert_eq!(layer.tunnel_state(), TunnelState::Establishing);

        let (mut client, hello) = client_hello(client_config, "example.com");
        let cmds = layer.handle_event(Event::data(&ctx.client, hello));
        let clienthello = find_hook(&cmds, "tls_clienthello");
        let CommandKind::Hook(Hook::TlsClientHello(data)) = &clienthello.kind else {
            unreachable!()
        };
        assert_eq!(data.lock().client_hello.sni.as_deref(), Some("example.com"));
        assert_eq!(ctx.client.lock().sni.as_deref(), Some("example.com"));

        let cmds = layer.handle_event(Event::completed(clienthello, None));
        let start = find_hook(&cmds, "tls_start_client");
        let CommandKind::Hook(Hook::TlsStartClient(data)) = &start.kind else {
            unreachable!()
        };
        data.lock().session = Some(Box::new(RustlsSession::server(server_config).unwrap()));

        let cmds = layer.handle_event(Event::completed(start, None));
        let server_flight = sent_to(&cmds, &ctx.client);
        assert!(!server_flight.is_empty());
        assert!(!ctx.client.lock().tls_established());

        feed(&mut client, &server_flight);
        assert!(!client.is_handshaking());
        let mut finished = Vec::new();
        client.write_tls(&mut finished).unwrap();

        let cmds = layer.handle_event(Event::data(&ctx.client, finished));
        let established = find_hook(&cmds, "tls_established_client");
        assert!(seen.lock().is_empty());
        layer.handle_event(Event::completed(established, None));

        assert_eq!(layer.tunnel_state(), TunnelState::Open);
        {
            let conn = ctx.client.lock();
            assert!(conn.tls_established());
            assert_eq!(conn.tls_version.as_deref(), Some("TLSv1.3"));
            assert!(conn.cipher.is_some());
        }
        assert_eq!(*seen.lock(), vec![Event::Start]);

        client.writer().write_all(b"hello").unwrap();
        let mut record = Vec::new();
        client.write_tls(&mut record).unwrap();
        layer.handle_event(Event::data(&ctx.client, record));
        assert_eq!(seen.lock().last(), Some(&Event::data(&ctx.client, "hello")));
    }

    /// Drives a `ClientTls` through a full handshake with a rustls client.
    fn establish(layer: &mut Engine<TunnelLayer<ClientTls>>, ctx: &Context) -> rustls::ClientConnection {
        let (server_config, client_config) = configs("example.com");
        layer.handle_event(Event::Start);
        let (mut client, hello) = client_hello(client_config, "example.com");
        let cmds = layer.handle_event(Event::data(&ctx.client, hello));
        let clienthello = find_hook(&cmds, "tls_clienthello");
        let cmds = layer.handle_event(Event::completed(clienthello, None));
        let start = find_hook(&cmds, "tls_start_client");
        let CommandKind::Hook(Hook::TlsStartClient(data)) = &start.kind else {
            unreachable!()
        };
        data.lock().session = Some(Box::new(RustlsSession::server(server_config).unwrap()));
        let cmds = layer.handle_event(Event::completed(start, None));
        feed(&mut client, &sent_to(&cmds, &ctx.client));

        let mut finished = Vec::new();
        client.write_tls(&mut finished).unwrap();
        let cmds = layer.handle_event(Event::data(&ctx.client, finished));
        feed(&mut client, &sent_to(&cmds, &ctx.client));
        let established = find_hook(&cmds, "tls_established_client");
        let cmds = layer.handle_event(Event::completed(established, None));
        feed(&mut client, &sent_to(&cmds, &ctx.client));
        assert_eq!(layer.tunnel_state(), TunnelState::Open);
        client
    }

    fn decrypt(client: &mut rustls::ClientConnection, mut data: &[u8]) -> Vec<u8> {
        let mut plaintext = Vec::new();
        while !data.is_empty() {
            client.read_tls(&mut data).unwrap();
            client.process_new_packets().unwrap();
            if let Err(e) = client.reader().read_to_end(&mut plaintext) {
                assert_eq!(e.kind(), io::ErrorKind::WouldBlock);
            }
        }
        plaintext
    }

    #[test]
    fn large_writes_are_encrypted_completely() {
        let ctx = tctx();
        let (recorder, seen) = Recorder::scripted(ctx.clone());
        let mut layer = ClientTls::layer(ctx.clone()).with_child(Box::new(recorder));
        let mut client = establish(&mut layer, &ctx);

        // Well above rustls' 64 KiB send buffer, on both ends.
        let payload = vec![b'x'; 200 * 1024];
        let mut records = Vec::new();
        let mut rest = &payload[..];
        while !rest.is_empty() {
            let n = client.writer().write(rest).unwrap();
            rest = &rest[n..];
            while client.wants_write() {
                client.write_tls(&mut records).unwrap();
            }
        }

        let cmds = layer.handle_event(Event::data(&ctx.client, records));
        assert!(logs(&cmds).is_empty(), "{:?}", logs(&cmds));
        assert!(!cmds
            .iter()
            .any(|c| matches!(c.kind, CommandKind::CloseConnection { .. })));
        assert_eq!(seen.lock().last(), Some(&Event::data(&ctx.client, payload.clone())));

        let reply = decrypt(&mut client, &sent_to(&cmds, &ctx.client));
        let mut expected = payload;
        expected.extend_from_slice(b"-reply");
        assert_eq!(reply.len(), expected.len());
        assert!(reply == expected);
    }

    #[test]
    fn garbage_fails_the_handshake_and_swallows_events() {
        let ctx = tctx();
        let (recorder, seen) = Recorder::new(ctx.clone());
        let mut layer = ClientTls::layer(ctx.clone()).with_child(Box::new(recorder));
        layer.handle_event(Event::Start);

        let cmds = layer.handle_event(Event::data(&ctx.client, "GET / HTTP/1.1\r\n\r\n"));
        assert!(logs(&cmds)[0].starts_with("Client TLS handshake failed. Cannot parse ClientHello: 474554"));
        let failed = find_hook(&cmds, "tls_failed_client");
        let cmds = layer.handle_event(Event::completed(failed, None));
        assert_eq!(
            cmds[0].kind,
            CommandKind::CloseConnection {
                connection: ctx.client.clone(),
                half_close: false
            }
        );
        layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert!(ctx.client.lock().error.as_deref().unwrap().starts_with("Cannot parse ClientHello"));
        assert!(seen.lock().is_empty());
        assert_eq!(layer.tunnel_state(), TunnelState::Closed);
    }

    #[test]
    fn missing_session_closes_client_early() {
        let ctx = tctx();
        let (_, client_config) = configs("example.com");
        let mut layer = ClientTls::layer(ctx.clone());
        layer.handle_event(Event::Start);
        let (_, hello) = client_hello(client_config, "example.com");
        let cmds = layer.handle_event(Event::data(&ctx.client, hello));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        let start = find_hook(&cmds, "tls_start_client");

        let cmds = layer.handle_event(Event::completed(start, None));
        assert_eq!(
            logs(&cmds),
            vec!["No TLS context was provided, failing connection."]
        );
        ctx.client.set_state(ConnectionState::CLOSED);
        let close = cmds.last().unwrap().clone();
        let cmds = layer.handle_event(Event::completed(close, None));
        // "connection closed early" is not logged again.
        assert!(logs(&cmds).is_empty());
        assert_eq!(ctx.client.lock().error.as_deref(), Some("connection closed early"));
    }

    #[test]
    fn server_tls_waits_for_client_hello() {
        let ctx = tctx();
        ctx.server.set_state(ConnectionState::OPEN);
        let (_, client_config) = configs("example.com");

        let server_tls = ServerTls::layer(ctx.clone(), None);
        let client_tls = ClientTls::layer(ctx.clone());
        assert!(client_tls.logic().proto.server_tls_available);
        let mut layer = server_tls.with_child(Box::new(client_tls));

        assert!(layer.handle_event(Event::Start).is_empty());
        assert_eq!(layer.tunnel_state(), TunnelState::Closed);

        let (_, hello) = client_hello(client_config, "example.com");
        let cmds = layer.handle_event(Event::data(&ctx.client, hello));
        let CommandKind::Hook(Hook::TlsClientHello(data)) = &cmds[0].kind else {
            panic!("expected clienthello hook, got {}", cmds[0]);
        };
        data.lock().establish_server_tls_first = true;

        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        // The child's OpenConnection is swallowed and turned into the server handshake.
        assert!(!cmds
            .iter()
            .any(|c| matches!(c.kind, CommandKind::OpenConnection { .. })));
        find_hook(&cmds, "tls_start_server");
        assert_eq!(layer.tunnel_state(), TunnelState::Establishing);
        assert!(layer.logic().replying_to_command());
    }

    #[test]
    fn describes_plaintext_servers() {
        let err = TlsError::Protocol(rustls::Error::InvalidMessage(
            rustls::InvalidMessage::InvalidContentType,
        ));
        assert_eq!(
            describe_error(&err, b"HTTP/1.1 400 Bad Request"),
            "The remote server does not speak TLS."
        );
    }
}
