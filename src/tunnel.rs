//! Tunnels
//!
//! A tunnel carries an inner connection over an outer one once a handshake has completed:
//! TLS over TCP, an HTTP CONNECT proxy, QUIC over UDP. [`TunnelLayer`] owns the shared state
//! machine. Protocols plug in through the [`Tunnel`] trait, whose default methods implement
//! a transparent tunnel.

use crate::commands::{Command, CommandKind};
use crate::connection::{ConnectionRef, ConnectionState};
use crate::context::Context;
use crate::events::Event;
use crate::layer::{Commands, Engine, Layer, Logic, NextLayer, Step};
use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::mem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Inactive,
    Establishing,
    Open,
    Closed,
}

/// `(done, error)` as reported by [`Tunnel::receive_handshake_data`].
pub type Handshake = (bool, Option<String>);

/// Protocol specific behavior of a [`TunnelLayer`].
pub trait Tunnel: Send + Sized + 'static {
    const NAME: &'static str;

    fn start_handshake(t: &mut TunnelLayer<Self>, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        let event = Event::data(&t.tunnel_connection, Bytes::new());
        Self::handle_event(t, event, out)
    }

    fn receive_handshake_data(
        _t: &mut TunnelLayer<Self>,
        _data: Bytes,
        _out: &mut Commands,
    ) -> Step<TunnelLayer<Self>, Handshake> {
        Step::Ready((true, None))
    }

    fn on_handshake_error(
        t: &mut TunnelLayer<Self>,
        _err: String,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        Step::emit(Command::close_connection(&t.tunnel_connection), out).map(|_| ())
    }

    fn receive_data(
        t: &mut TunnelLayer<Self>,
        data: Bytes,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        let event = Event::data(&t.conn, data);
        t.event_to_child(event, out)
    }

    fn receive_close(t: &mut TunnelLayer<Self>, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        let event = Event::closed(&t.conn);
        t.event_to_child(event, out)
    }

    fn send_data(
        t: &mut TunnelLayer<Self>,
        data: Bytes,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        out.push(Command::send_data(&t.tunnel_connection, data));
        Step::done()
    }

    /// `command` already targets the outer connection and is claimed by the child.
    fn send_close(
        _t: &mut TunnelLayer<Self>,
        command: Command,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        out.push(command);
        Step::done()
    }

    fn handle_event(
        t: &mut TunnelLayer<Self>,
        event: Event,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        t.handle_tunnel_event(event, out)
    }

    fn handle_command(
        t: &mut TunnelLayer<Self>,
        command: Command,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        t.handle_tunnel_command(command, out)
    }

    fn event_to_child(
        t: &mut TunnelLayer<Self>,
        event: Event,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>> {
        t.deliver_to_child(event, out)
    }
}

pub struct TunnelLayer<P: Tunnel> {
    pub context: Context,
    pub proto: P,
    pub child: Box<dyn Layer>,
    /// The outer connection bytes are actually exchanged on.
    pub tunnel_connection: ConnectionRef,
    /// The inner connection application data belongs to.
    pub conn: ConnectionRef,
    pub tunnel_state: TunnelState,
    command_to_reply_to: Option<Command>,
    event_queue: Vec<Event>,
}

impl<P: Tunnel> TunnelLayer<P> {
    /// Builds the tunnel with a [`NextLayer`] as child.
    pub fn new(
        context: Context,
        tunnel_connection: ConnectionRef,
        conn: ConnectionRef,
        proto: P,
    ) -> Engine<Self> {
        let child = NextLayer::boxed(context.clone());
        Engine::new(
            context.clone(),
            Self {
                context,
                proto,
                child,
                tunnel_connection,
                conn,
                tunnel_state: TunnelState::Inactive,
                command_to_reply_to: None,
                event_queue: Vec::new(),
            },
        )
    }

    /// True while an `OpenConnection` from the child waits for the handshake.
    pub fn replying_to_command(&self) -> bool {
        self.command_to_reply_to.is_some()
    }

    /// Takes over the child's `OpenConnection` and answers it once a handshake over the
    /// already open tunnel connection finishes.
    pub fn establish_for(&mut self, command: Command, out: &mut Commands) -> Step<Self> {
        self.command_to_reply_to = Some(command);
        self.tunnel_state = TunnelState::Establishing;
        P::start_handshake(self, out)
    }

    pub fn handle_tunnel_event(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        match event {
            Event::Start => {
                let step = if self.tunnel_connection.state().is_closed() {
                    Step::done()
                } else {
                    self.tunnel_state = TunnelState::Establishing;
                    P::start_handshake(self, out)
                };
                step.then(self, out, |this: &mut Self, out, ()| {
                    this.event_to_child(Event::Start, out)
                })
            }
            Event::DataReceived { connection, data } if connection == self.tunnel_connection => {
                if self.tunnel_state == TunnelState::Establishing {
                    P::receive_handshake_data(self, data, out).then(
                        self,
                        out,
                        |this: &mut Self, out, (done, err)| this.handshake_progress(done, err, out),
                    )
                } else {
                    P::receive_data(self, data, out)
                }
            }
            Event::ConnectionClosed { connection } if connection == self.tunnel_connection => {
                if self.conn != self.tunnel_connection {
                    let mut conn = self.conn.lock();
                    conn.state = conn.state.without(ConnectionState::CAN_READ);
                    conn.timestamp_end = Some(Utc::now());
                }
                let step = match self.tunnel_state {
                    TunnelState::Open => P::receive_close(self, out),
                    TunnelState::Establishing => {
                        let err = "connection closed".to_string();
                        P::on_handshake_error(self, err.clone(), out).then(
                            self,
                            out,
                            move |this: &mut Self, out, ()| this.handshake_finished(Some(err), out),
                        )
                    }
                    TunnelState::Inactive | TunnelState::Closed => Step::done(),
                };
                step.then(self, out, |this: &mut Self, _, ()| {
                    this.tunnel_state = TunnelState::Closed;
                    Step::done()
                })
            }
            event if event.concerns(&self.tunnel_connection) => {
                panic!("{}: unexpected event {}", P::NAME, event)
            }
            event => self.event_to_child(event, out),
        }
    }

    fn handshake_progress(
        &mut self,
        done: bool,
        err: Option<String>,
        out: &mut Commands,
    ) -> Step<Self> {
        let distinct = self.conn != self.tunnel_connection;
        if done && distinct {
            let mut conn = self.conn.lock();
            conn.state = ConnectionState::OPEN;
            conn.timestamp_start = Some(Utc::now());
        }
        match err {
            Some(err) => {
                if distinct {
                    self.conn.set_state(ConnectionState::CLOSED);
                }
                P::on_handshake_error(self, err.clone(), out).then(
                    self,
                    out,
                    move |this: &mut Self, out, ()| this.handshake_finished(Some(err), out),
                )
            }
            None if done => self.handshake_finished(None, out),
            None => Step::done(),
        }
    }

    /// Either answers the child's pending `OpenConnection` or replays what was buffered
    /// during the handshake. Never both.
    fn handshake_finished(&mut self, err: Option<String>, out: &mut Commands) -> Step<Self> {
        self.tunnel_state = if err.is_some() {
            TunnelState::Closed
        } else {
            TunnelState::Open
        };
        match self.command_to_reply_to.take() {
            Some(command) => self.event_to_child(Event::completed(command, err), out),
            None => {
                let queued = mem::take(&mut self.event_queue);
                self.replay(queued.into(), out)
            }
        }
    }

    fn replay(&mut self, mut events: VecDeque<Event>, out: &mut Commands) -> Step<Self> {
        while let Some(event) = events.pop_front() {
            match self.event_to_child(event, out) {
                Step::Ready(()) => {}
                blocked => {
                    return blocked.then(self, out, move |this: &mut Self, out, ()| {
                        this.replay(events, out)
                    })
                }
            }
        }
        Step::done()
    }

    pub fn event_to_child(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        P::event_to_child(self, event, out)
    }

    /// Hands an event to the child, or buffers it while a handshake nobody asked for runs.
    pub fn deliver_to_child(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        if self.tunnel_state == TunnelState::Establishing && self.command_to_reply_to.is_none() {
            self.event_queue.push(event);
            return Step::done();
        }
        let commands = self.child.handle_event(event);
        self.handle_child_commands(commands.into(), out)
    }

    fn handle_child_commands(
        &mut self,
        mut commands: VecDeque<Command>,
        out: &mut Commands,
    ) -> Step<Self> {
        while let Some(command) = commands.pop_front() {
            match P::handle_command(self, command, out) {
                Step::Ready(()) => {}
                blocked => {
                    return blocked.then(self, out, move |this: &mut Self, out, ()| {
                        this.handle_child_commands(commands, out)
                    })
                }
            }
        }
        Step::done()
    }

    pub fn handle_tunnel_command(&mut self, mut command: Command, out: &mut Commands) -> Step<Self> {
        if !command.targets(&self.conn) {
            out.push(command);
            return Step::done();
        }
        if let CommandKind::SendData { data, .. } = &command.kind {
            let data = data.clone();
            return P::send_data(self, data, out);
        }
        if matches!(command.kind, CommandKind::CloseConnection { .. }) {
            if self.conn != self.tunnel_connection {
                {
                    let mut conn = self.conn.lock();
                    conn.state = conn.state.without(ConnectionState::CAN_WRITE);
                }
                command.set_connection(self.tunnel_connection.clone());
            }
            return P::send_close(self, command, out);
        }
        if !matches!(command.kind, CommandKind::OpenConnection { .. }) {
            panic!("{}: unexpected command {}", P::NAME, command);
        }

        self.command_to_reply_to = Some(command);
        self.tunnel_state = TunnelState::Establishing;
        let open = Command::open_connection(&self.tunnel_connection);
        Step::emit(open, out).then(self, out, |this: &mut Self, out, err| match err {
            Some(err) => {
                this.tunnel_state = TunnelState::Closed;
                match this.command_to_reply_to.take() {
                    Some(command) => this.event_to_child(Event::completed(command, Some(err)), out),
                    None => Step::done(),
                }
            }
            None => P::start_handshake(this, out),
        })
    }
}

impl<P: Tunnel> Logic for TunnelLayer<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        P::handle_event(self, event, out)
    }

    fn describe(&self) -> String {
        format!("{}({:?})", P::NAME, self.tunnel_state)
    }

    fn child_mut(&mut self) -> Option<&mut Box<dyn Layer>> {
        Some(&mut self.child)
    }
}

impl<P: Tunnel> Engine<TunnelLayer<P>> {
    pub fn with_child(mut self, child: Box<dyn Layer>) -> Self {
        self.logic_mut().child = child;
        self
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.logic().tunnel_state
    }
}

/// Assembles nested layers, outermost first.
#[derive(Default)]
pub struct LayerStack {
    layers: Vec<Box<dyn Layer>>,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Nests every layer into the one before it and returns the outermost.
    pub fn build(mut self) -> Option<Box<dyn Layer>> {
        let mut inner = self.layers.pop()?;
        while let Some(mut outer) = self.layers.pop() {
            match outer.child_mut() {
                Some(slot) => *slot = inner,
                None => panic!("{} cannot wrap {}", outer.name(), inner.name()),
            }
            inner = outer;
        }
        Some(inner)
    }
}
