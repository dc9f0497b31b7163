//! QUIC
//!
//! [`ClientQuic`] and [`ServerQuic`] terminate QUIC on a UDP connection and turn the connection
//! into stream events. [`RawQuicLayer`] below them gives every stream its own layer stack.
//! The QUIC state machine itself sits behind [`QuicSession`]; addons provide one through the
//! `quic_start_client` / `quic_start_server` hooks.

mod raw;
mod stream;

pub use raw::RawQuicLayer;
pub use stream::QuicStreamLayer;

use crate::commands::{Command, CommandId, CommandKind};
use crate::connection::{Certificate, ConnectionRef};
use crate::context::Context;
use crate::events::Event;
use crate::hooks::{shared, Hook};
use crate::layer::{Commands, Engine, NextLayer, Step};
use crate::layers::tls::TlsData;
use crate::tunnel::{Handshake, Tunnel, TunnelLayer};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Level;

pub const NO_ERROR: u64 = 0x0;
pub const H3_NO_ERROR: u64 = 0x100;

/// Wakeups are requested this much after the session's timer, so one wakeup covers timers
/// that are due at nearly the same time.
const TIMER_SLACK: Duration = Duration::from_millis(2);

pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Instant::now)
}

pub fn stream_is_client_initiated(stream_id: u64) -> bool {
    stream_id & 0x1 == 0
}

pub fn stream_is_unidirectional(stream_id: u64) -> bool {
    stream_id & 0x2 != 0
}

/// Name of a QUIC transport or HTTP/3 error code.
pub fn error_code_to_str(error_code: u64) -> String {
    let name = match error_code {
        0x0 => "NO_ERROR",
        0x1 => "INTERNAL_ERROR",
        0x2 => "CONNECTION_REFUSED",
        0x3 => "FLOW_CONTROL_ERROR",
        0x4 => "STREAM_LIMIT_ERROR",
        0x5 => "STREAM_STATE_ERROR",
        0x6 => "FINAL_SIZE_ERROR",
        0x7 => "FRAME_ENCODING_ERROR",
        0x8 => "TRANSPORT_PARAMETER_ERROR",
        0x9 => "CONNECTION_ID_LIMIT_ERROR",
        0xA => "PROTOCOL_VIOLATION",
        0xB => "INVALID_TOKEN",
        0xC => "APPLICATION_ERROR",
        0xD => "CRYPTO_BUFFER_EXCEEDED",
        0xE => "KEY_UPDATE_ERROR",
        0xF => "AEAD_LIMIT_REACHED",
        0x100 => "H3_NO_ERROR",
        0x101 => "H3_GENERAL_PROTOCOL_ERROR",
        0x102 => "H3_INTERNAL_ERROR",
        0x103 => "H3_STREAM_CREATION_ERROR",
        0x104 => "H3_CLOSED_CRITICAL_STREAM",
        0x105 => "H3_FRAME_UNEXPECTED",
        0x106 => "H3_FRAME_ERROR",
        0x107 => "H3_EXCESSIVE_LOAD",
        0x108 => "H3_ID_ERROR",
        0x109 => "H3_SETTINGS_ERROR",
        0x10A => "H3_MISSING_SETTINGS",
        0x10B => "H3_REQUEST_REJECTED",
        0x10C => "H3_REQUEST_CANCELLED",
        0x10D => "H3_REQUEST_INCOMPLETE",
        0x10E => "H3_MESSAGE_ERROR",
        0x10F => "H3_CONNECT_ERROR",
        0x110 => "H3_VERSION_FALLBACK",
        0x101..=0x1FF => return format!("CRYPTO_ERROR (0x{:x})", error_code),
        _ => return format!("unknown error (0x{:x})", error_code),
    };
    name.to_string()
}

pub fn is_success_error_code(error_code: u64) -> bool {
    error_code == NO_ERROR || error_code == H3_NO_ERROR
}

/// Why a QUIC connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub error_code: u64,
    pub frame_type: Option<u64>,
    pub reason: String,
}

impl CloseInfo {
    fn describe(&self) -> String {
        if self.reason.is_empty() {
            error_code_to_str(self.error_code)
        } else {
            self.reason.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuicEvent {
    HandshakeCompleted {
        alpn: Option<Vec<u8>>,
        cipher: Option<String>,
        peer_certificates: Vec<Certificate>,
    },
    ConnectionTerminated(CloseInfo),
    StreamDataReceived {
        stream_id: u64,
        data: Bytes,
        end_stream: bool,
    },
    StreamReset {
        stream_id: u64,
        error_code: u64,
    },
    StopSendingReceived {
        stream_id: u64,
        error_code: u64,
    },
    DatagramFrameReceived(Bytes),
    /// Connection id changes, pings and the like.
    Other,
}

/// The sans-IO surface of a QUIC connection.
pub trait QuicSession: Send {
    /// Starts the handshake. Only called when acting as client.
    fn connect(&mut self, now: Instant);

    fn receive_datagram(&mut self, data: &[u8], now: Instant);

    fn datagrams_to_send(&mut self, now: Instant) -> Vec<Bytes>;

    /// When [`QuicSession::handle_timer`] wants to run next.
    fn timer(&self) -> Option<Instant>;

    fn handle_timer(&mut self, now: Instant);

    fn next_event(&mut self) -> Option<QuicEvent>;

    fn send_stream_data(&mut self, stream_id: u64, data: Bytes, end_stream: bool);

    /// Returns false if the stream was reset before.
    fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> bool;

    fn stop_stream(&mut self, stream_id: u64, error_code: u64);

    fn send_datagram_frame(&mut self, data: Bytes);

    fn close(&mut self, error_code: u64, frame_type: Option<u64>, reason: &str);

    fn is_terminated(&self) -> bool;

    /// Set once a close frame was sent or received.
    fn close_info(&self) -> Option<CloseInfo>;
}

/// Payload of the `quic_start_*` hooks. Addons fill in `session`.
pub struct QuicTlsData {
    pub conn: ConnectionRef,
    pub context: Context,
    pub session: Option<Box<dyn QuicSession>>,
}

impl QuicTlsData {
    pub fn new(conn: &ConnectionRef, context: &Context) -> Self {
        Self {
            conn: conn.clone(),
            context: context.clone(),
            session: None,
        }
    }
}

struct QuicCore {
    session: Option<Box<dyn QuicSession>>,
    clock: Clock,
    wakeups: HashMap<CommandId, Instant>,
    started: bool,
}

impl QuicCore {
    fn new(clock: Clock) -> Self {
        Self {
            session: None,
            clock,
            wakeups: HashMap::new(),
            started: false,
        }
    }

    fn now(&self) -> Instant {
        (self.clock)()
    }
}

trait QuicSide: Tunnel {
    fn core(&mut self) -> &mut QuicCore;
}

fn is_client<P: QuicSide>(t: &TunnelLayer<P>) -> bool {
    t.conn == t.context.client
}

fn debug_log<P: QuicSide>(t: &TunnelLayer<P>, out: &mut Commands, message: String) {
    if t.context.options.proxy_debug {
        out.push(Command::log(message, Level::DEBUG));
    }
}

fn next_event<P: QuicSide>(t: &mut TunnelLayer<P>) -> Option<QuicEvent> {
    t.proto.core().session.as_mut()?.next_event()
}

/// Sends pending datagrams and re-arms the timer.
fn interact<P: QuicSide>(t: &mut TunnelLayer<P>, out: &mut Commands) {
    let core = t.proto.core();
    let now = core.now();
    let Some(session) = core.session.as_mut() else {
        return;
    };
    for datagram in session.datagrams_to_send(now) {
        out.push(Command::send_data(&t.tunnel_connection, datagram));
    }
    let Some(timer) = session.timer() else {
        return;
    };
    let smoothed = timer + TIMER_SLACK;
    if core.wakeups.values().any(|at| *at <= smoothed) {
        return;
    }
    let wakeup = Command::request_wakeup(timer.saturating_duration_since(now));
    core.wakeups.insert(wakeup.id(), timer);
    out.push(wakeup);
}

/// Asks addons for a session. Closes the connection if none is provided.
fn start_quic<P: QuicSide>(
    t: &mut TunnelLayer<P>,
    connect: bool,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    t.proto.core().started = true;
    let data = shared(QuicTlsData::new(&t.conn, &t.context));
    let hook = if is_client(t) {
        Hook::QuicStartClient(data.clone())
    } else {
        Hook::QuicStartServer(data.clone())
    };
    Step::emit(Command::hook(hook), out).then(t, out, move |this: &mut TunnelLayer<P>, out, _| {
        let session = data.lock().session.take();
        let Some(mut session) = session else {
            out.push(Command::log(
                "No QUIC context was provided, failing connection.",
                Level::ERROR,
            ));
            return Step::emit(Command::close_connection(&this.conn), out).map(|_| ());
        };
        let core = this.proto.core();
        if connect {
            session.connect(core.now());
        }
        core.session = Some(session);
        if connect {
            interact(this, out);
        }
        Step::done()
    })
}

fn handshake<P: QuicSide>(
    t: &mut TunnelLayer<P>,
    data: Bytes,
    out: &mut Commands,
) -> Step<TunnelLayer<P>, Handshake> {
    let core = t.proto.core();
    let now = core.now();
    let Some(session) = core.session.as_mut() else {
        return Step::Ready((false, None));
    };
    if !data.is_empty() {
        session.receive_datagram(&data, now);
    }
    while let Some(event) = next_event(t) {
        match event {
            QuicEvent::ConnectionTerminated(info) => {
                return Step::Ready((false, Some(info.describe())));
            }
            QuicEvent::HandshakeCompleted {
                alpn,
                cipher,
                peer_certificates,
            } => {
                {
                    let mut conn = t.conn.lock();
                    conn.timestamp_tls_setup = Some(Utc::now());
                    conn.alpn = alpn;
                    conn.cipher = cipher;
                    conn.certificate_list = peer_certificates;
                    conn.tls_version = Some("QUICv1".to_string());
                }
                debug_log(t, out, format!("[quic] tls established: {}", t.conn));
                let data = shared(TlsData::new(&t.conn, &t.context));
                let hook = if is_client(t) {
                    Hook::TlsEstablishedClient(data)
                } else {
                    Hook::TlsEstablishedServer(data)
                };
                return Step::emit(Command::hook(hook), out).then(
                    t,
                    out,
                    |this: &mut TunnelLayer<P>, out, _| {
                        interact(this, out);
                        Step::Ready((true, None))
                    },
                );
            }
            _ => {}
        }
    }
    interact(t, out);
    Step::Ready((false, None))
}

fn handshake_failed<P: QuicSide>(
    t: &mut TunnelLayer<P>,
    err: String,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    t.conn.lock().error = Some(err);
    let data = shared(TlsData::new(&t.conn, &t.context));
    let hook = if is_client(t) {
        Hook::TlsFailedClient(data)
    } else {
        Hook::TlsFailedServer(data)
    };
    Step::emit(Command::hook(hook), out).then(t, out, |this: &mut TunnelLayer<P>, out, _| {
        Step::emit(Command::close_connection(&this.tunnel_connection), out).map(|_| ())
    })
}

fn receive_data<P: QuicSide>(
    t: &mut TunnelLayer<P>,
    data: Bytes,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    let core = t.proto.core();
    let now = core.now();
    let Some(session) = core.session.as_mut() else {
        return Step::done();
    };
    if !data.is_empty() {
        session.receive_datagram(&data, now);
    }
    dispatch_events(t, out)
}

/// Hands connection events to the child, one at a time.
fn dispatch_events<P: QuicSide>(t: &mut TunnelLayer<P>, out: &mut Commands) -> Step<TunnelLayer<P>> {
    while let Some(event) = next_event(t) {
        let conn = t.conn.clone();
        let event = match event {
            QuicEvent::ConnectionTerminated(info) => {
                debug_log(
                    t,
                    out,
                    format!("[quic] close_notify {} (reason={})", t.conn, info.describe()),
                );
                // QuicConnectionClosed is sent once the UDP connection is gone.
                return Step::emit(Command::close_connection(&t.tunnel_connection), out).map(|_| ());
            }
            QuicEvent::DatagramFrameReceived(data) => Event::data(&conn, data),
            QuicEvent::StreamDataReceived {
                stream_id,
                data,
                end_stream,
            } => Event::QuicStreamDataReceived {
                connection: conn,
                stream_id,
                data,
                end_stream,
            },
            QuicEvent::StreamReset {
                stream_id,
                error_code,
            } => Event::QuicStreamReset {
                connection: conn,
                stream_id,
                error_code,
            },
            QuicEvent::StopSendingReceived {
                stream_id,
                error_code,
            } => Event::QuicStreamStopSending {
                connection: conn,
                stream_id,
                error_code,
            },
            QuicEvent::HandshakeCompleted { .. } | QuicEvent::Other => continue,
        };
        let step = t.event_to_child(event, out);
        if !step.is_ready() {
            return step.then(t, out, |this: &mut TunnelLayer<P>, out, ()| {
                dispatch_events(this, out)
            });
        }
    }
    interact(t, out);
    Step::done()
}

fn receive_close<P: QuicSide>(t: &mut TunnelLayer<P>, out: &mut Commands) -> Step<TunnelLayer<P>> {
    let info = t
        .proto
        .core()
        .session
        .as_ref()
        .and_then(|s| s.close_info())
        .unwrap_or(CloseInfo {
            error_code: NO_ERROR,
            frame_type: None,
            reason: "Connection closed.".to_string(),
        });
    let event = Event::QuicConnectionClosed {
        connection: t.conn.clone(),
        error_code: info.error_code,
        frame_type: info.frame_type,
        reason: info.reason,
    };
    t.event_to_child(event, out)
}

fn send_data<P: QuicSide>(t: &mut TunnelLayer<P>, data: Bytes, out: &mut Commands) -> Step<TunnelLayer<P>> {
    if let Some(session) = t.proto.core().session.as_mut() {
        if !data.is_empty() {
            session.send_datagram_frame(data);
        }
    }
    interact(t, out);
    Step::done()
}

fn send_close<P: QuicSide>(
    t: &mut TunnelLayer<P>,
    command: Command,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    if let Some(session) = t.proto.core().session.as_mut() {
        match &command.kind {
            CommandKind::CloseQuicConnection {
                error_code,
                frame_type,
                reason,
                ..
            } => session.close(*error_code, *frame_type, reason),
            _ => session.close(NO_ERROR, None, ""),
        }
        interact(t, out);
    }
    out.push(command);
    Step::done()
}

/// Wakeups we requested run the session's timer. Everything else takes the usual path.
fn handle_event<P: QuicSide>(
    t: &mut TunnelLayer<P>,
    event: Event,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    if let Event::CommandCompleted { command, .. } = &event {
        let core = t.proto.core();
        if let Some(scheduled) = core.wakeups.remove(&command.id()) {
            let now = core.now().max(scheduled);
            match core.session.as_mut() {
                Some(session) if !session.is_terminated() => session.handle_timer(now),
                _ => return Step::done(),
            }
            let event = Event::data(&t.tunnel_connection, Bytes::new());
            return t.handle_tunnel_event(event, out);
        }
    }
    t.handle_tunnel_event(event, out)
}

fn event_to_child<P: QuicSide>(
    t: &mut TunnelLayer<P>,
    event: Event,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    // Stream commands of the child only queue data. Transmit once it is done.
    t.deliver_to_child(event, out)
        .then(t, out, |this: &mut TunnelLayer<P>, out, ()| {
            interact(this, out);
            Step::done()
        })
}

/// Turns the child's stream commands into session calls.
fn handle_command<P: QuicSide>(
    t: &mut TunnelLayer<P>,
    command: Command,
    out: &mut Commands,
) -> Step<TunnelLayer<P>> {
    if !command.targets(&t.conn) {
        return t.handle_tunnel_command(command, out);
    }
    match command.kind {
        CommandKind::CloseQuicConnection { .. } => return send_close(t, command, out),
        CommandKind::SendQuicStreamData { .. }
        | CommandKind::ResetQuicStream { .. }
        | CommandKind::StopSendingQuicStream { .. } => {}
        _ => return t.handle_tunnel_command(command, out),
    }
    let debug = t.context.options.proxy_debug;
    let Some(session) = t.proto.core().session.as_mut() else {
        panic!("{}: {} before QUIC was started", P::NAME, command);
    };
    match command.kind {
        CommandKind::SendQuicStreamData {
            stream_id,
            data,
            end_stream,
            ..
        } => session.send_stream_data(stream_id, data, end_stream),
        CommandKind::ResetQuicStream {
            stream_id,
            error_code,
            ..
        } => {
            if !session.reset_stream(stream_id, error_code) && debug {
                out.push(Command::log(
                    format!("[quic] stream {} already reset", stream_id),
                    Level::DEBUG,
                ));
            }
        }
        CommandKind::StopSendingQuicStream {
            stream_id,
            error_code,
            ..
        } => session.stop_stream(stream_id, error_code),
        _ => {}
    }
    Step::done()
}

/// QUIC towards a server.
pub struct ServerQuic {
    core: QuicCore,
}

impl ServerQuic {
    pub const NAME: &'static str = "ServerQuicLayer";

    pub fn layer(
        context: Context,
        conn: Option<ConnectionRef>,
        clock: Clock,
    ) -> Engine<TunnelLayer<Self>> {
        let conn = conn.unwrap_or_else(|| context.server.clone());
        conn.lock().tls = true;
        let child = Box::new(NextLayer::new(context.clone(), true));
        let proto = Self {
            core: QuicCore::new(clock),
        };
        TunnelLayer::new(context, conn.clone(), conn, proto).with_child(child)
    }
}

impl QuicSide for ServerQuic {
    fn core(&mut self) -> &mut QuicCore {
        &mut self.core
    }
}

impl Tunnel for ServerQuic {
    const NAME: &'static str = ServerQuic::NAME;

    fn start_handshake(t: &mut TunnelLayer<Self>, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        start_quic(t, true, out)
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
            format!("Server QUIC handshake failed. {}", err),
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

    fn handle_event(t: &mut TunnelLayer<Self>, event: Event, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        handle_event(t, event, out)
    }

    fn handle_command(
        t: &mut TunnelLayer<Self>,
        command: Command,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        handle_command(t, command, out)
    }

    fn event_to_child(t: &mut TunnelLayer<Self>, event: Event, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        event_to_child(t, event, out)
    }
}

/// QUIC towards the client. The handshake starts with the client's first datagram.
pub struct ClientQuic {
    core: QuicCore,
}

impl ClientQuic {
    pub const NAME: &'static str = "ClientQuicLayer";

    pub fn layer(context: Context, clock: Clock) -> Engine<TunnelLayer<Self>> {
        {
            let mut client = context.client.lock();
            if client.tls {
                // Nested in another secure transport: start with a clean slate.
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
        let conn = context.client.clone();
        let child = Box::new(NextLayer::new(context.clone(), true));
        let proto = Self {
            core: QuicCore::new(clock),
        };
        TunnelLayer::new(context, conn.clone(), conn, proto).with_child(child)
    }
}

impl QuicSide for ClientQuic {
    fn core(&mut self) -> &mut QuicCore {
        &mut self.core
    }
}

impl Tunnel for ClientQuic {
    const NAME: &'static str = ClientQuic::NAME;

    fn start_handshake(_t: &mut TunnelLayer<Self>, _out: &mut Commands) -> Step<TunnelLayer<Self>> {
        Step::done()
    }

    fn receive_handshake_data(
        t: &mut TunnelLayer<Self>,
        data: Bytes,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>, Handshake> {
        if t.proto.core.started {
            return handshake(t, data, out);
        }
        if data.is_empty() {
            return Step::Ready((false, None));
        }
        start_quic(t, false, out).then(t, out, move |this: &mut TunnelLayer<Self>, out, ()| {
            handshake(this, data, out)
        })
    }

    fn on_handshake_error(
        t: &mut TunnelLayer<Self>,
        err: String,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        out.push(Command::log(
            format!("Client QUIC handshake failed. {}", err),
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

    fn handle_event(t: &mut TunnelLayer<Self>, event: Event, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        handle_event(t, event, out)
    }

    fn handle_command(
        t: &mut TunnelLayer<Self>,
        command: Command,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        handle_command(t, command, out)
    }

    fn event_to_child(t: &mut TunnelLayer<Self>, event: Event, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        event_to_child(t, event, out)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::hooks::Shared;
    use parking_lot::Mutex;

    /// Scripted session. Tests push events and read back what the layer asked for.
    #[derive(Default)]
    pub struct FakeQuic {
        pub connected: bool,
        pub received: Vec<Bytes>,
        pub outgoing: Vec<Bytes>,
        pub events: Vec<QuicEvent>,
        pub timer: Option<Instant>,
        pub timers_run: usize,
        pub stream_data: Vec<(u64, Bytes, bool)>,
        pub resets: Vec<(u64, u64)>,
        pub stops: Vec<(u64, u64)>,
        pub datagrams: Vec<Bytes>,
        pub closed: Option<CloseInfo>,
        /// Events released by the next received datagram.
        pub on_receive: Vec<QuicEvent>,
    }

    /// Gives tests a handle to a session that the layer owns.
    pub struct SharedQuic(pub Shared<FakeQuic>);

    impl QuicSession for SharedQuic {
        fn connect(&mut self, _now: Instant) {
            let mut s = self.0.lock();
            s.connected = true;
            s.outgoing.push(Bytes::from_static(b"initial"));
        }

        fn receive_datagram(&mut self, data: &[u8], _now: Instant) {
            let mut s = self.0.lock();
            s.received.push(Bytes::copy_from_slice(data));
            let released: Vec<_> = s.on_receive.drain(..).collect();
            s.events.extend(released);
        }

        fn datagrams_to_send(&mut self, _now: Instant) -> Vec<Bytes> {
            self.0.lock().outgoing.drain(..).collect()
        }

        fn timer(&self) -> Option<Instant> {
            self.0.lock().timer
        }

        fn handle_timer(&mut self, _now: Instant) {
            let mut s = self.0.lock();
            s.timers_run += 1;
            s.timer = None;
        }

        fn next_event(&mut self) -> Option<QuicEvent> {
            let mut s = self.0.lock();
            if s.events.is_empty() {
                None
            } else {
                Some(s.events.remove(0))
            }
        }

        fn send_stream_data(&mut self, stream_id: u64, data: Bytes, end_stream: bool) {
            self.0.lock().stream_data.push((stream_id, data, end_stream));
        }

        fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> bool {
            let mut s = self.0.lock();
            let first = !s.resets.iter().any(|(id, _)| *id == stream_id);
            if first {
                s.resets.push((stream_id, error_code));
            }
            first
        }

        fn stop_stream(&mut self, stream_id: u64, error_code: u64) {
            self.0.lock().stops.push((stream_id, error_code));
        }

        fn send_datagram_frame(&mut self, data: Bytes) {
            self.0.lock().datagrams.push(data);
        }

        fn close(&mut self, error_code: u64, frame_type: Option<u64>, reason: &str) {
            let mut s = self.0.lock();
            s.closed = Some(CloseInfo {
                error_code,
                frame_type,
                reason: reason.to_string(),
            });
            s.outgoing.push(Bytes::from_static(b"close"));
        }

        fn is_terminated(&self) -> bool {
            self.0.lock().closed.is_some()
        }

        fn close_info(&self) -> Option<CloseInfo> {
            self.0.lock().closed.clone()
        }
    }

    pub fn fake_session() -> (Box<dyn QuicSession>, Shared<FakeQuic>) {
        let state = Arc::new(Mutex::new(FakeQuic::default()));
        (Box::new(SharedQuic(state.clone())), state)
    }

    /// A clock tests move by hand.
    pub fn manual_clock() -> (Clock, Shared<Instant>) {
        let now = Arc::new(Mutex::new(Instant::now()));
        let handle = now.clone();
        (Arc::new(move || *handle.lock()), now)
    }
}
