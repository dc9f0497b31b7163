use super::stream::QuicStreamLayer;
use super::{stream_is_client_initiated, stream_is_unidirectional, NO_ERROR};
use crate::commands::{Command, CommandId, CommandKind};
use crate::connection::{ConnectionRef, ConnectionState};
use crate::context::Context;
use crate::events::Event;
use crate::layer::{Commands, Engine, Layer, Logic, NextLayer, Step};
use crate::layers::relay::RelayLayer;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

/// Where a child's events go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Route {
    Datagrams,
    /// Keyed by the client side stream id.
    Stream(u64),
}

/// Gives every stream of a QUIC connection its own layer stack.
///
/// Datagram frames are handled by a separate child as plain `DataReceived`/`SendData`. It
/// shares the QUIC connections, so it needs no stream bookkeeping.
pub struct RawQuicLayer {
    context: Context,
    ignore: bool,
    datagram_layer: Box<dyn Layer>,
    streams: BTreeMap<u64, QuicStreamLayer>,
    /// Server stream id to client stream id.
    server_stream_ids: HashMap<u64, u64>,
    connections: HashMap<ConnectionRef, Route>,
    /// Blocking commands and wakeups, so completions find their way back.
    command_sources: HashMap<CommandId, Route>,
    /// Next id for every (unidirectional, server initiated) combination.
    next_stream_id: [u64; 4],
    done: bool,
}

impl RawQuicLayer {
    pub const NAME: &'static str = "RawQuicLayer";

    pub fn new(context: Context, ignore: bool) -> Engine<Self> {
        let datagram_context = context.fork().with_server(context.server.clone());
        let datagram_layer: Box<dyn Layer> = if ignore {
            Box::new(RelayLayer::udp(datagram_context, false))
        } else {
            NextLayer::boxed(datagram_context)
        };
        let connections = HashMap::from([
            (context.client.clone(), Route::Datagrams),
            (context.server.clone(), Route::Datagrams),
        ]);
        Engine::new(
            context.clone(),
            Self {
                context,
                ignore,
                datagram_layer,
                streams: BTreeMap::new(),
                server_stream_ids: HashMap::new(),
                connections,
                command_sources: HashMap::new(),
                next_stream_id: [0, 1, 2, 3],
                done: false,
            },
        )
    }

    pub fn stream(&self, client_stream_id: u64) -> Option<&QuicStreamLayer> {
        self.streams.get(&client_stream_id)
    }

    pub fn next_available_stream_id(&mut self, is_client: bool, is_unidirectional: bool) -> u64 {
        let index = (usize::from(is_unidirectional) << 1) | usize::from(!is_client);
        let stream_id = self.next_stream_id[index];
        self.next_stream_id[index] = stream_id + 4;
        stream_id
    }

    fn start(&mut self, out: &mut Commands) -> Step<Self> {
        let opened = self.context.server.lock().timestamp_start.is_some();
        let step = if opened {
            Step::done()
        } else {
            let server = self.context.server.clone();
            Step::emit(Command::open_connection(&server), out).then(
                self,
                out,
                |this: &mut Self, out, err| {
                    if err.is_none() {
                        return Step::done();
                    }
                    this.done = true;
                    let client = this.context.client.clone();
                    Step::emit(Command::close_connection(&client), out).map(|_| ())
                },
            )
        };
        step.then(self, out, |this: &mut Self, out, ()| {
            if !this.done {
                let commands = this.event_to_child(Route::Datagrams, Event::Start);
                out.extend(commands);
            }
            Step::done()
        })
    }

    /// Finds or creates the stream layer for a stream event from `from_client`'s side.
    fn stream_for(&mut self, from_client: bool, stream_id: u64, out: &mut Commands) -> u64 {
        let known = if from_client {
            self.streams.contains_key(&stream_id).then_some(stream_id)
        } else {
            self.server_stream_ids.get(&stream_id).copied()
        };
        if let Some(id) = known {
            return id;
        }
        assert_eq!(
            stream_is_client_initiated(stream_id),
            from_client,
            "stream {} is not registered",
            stream_id
        );
        let (client_stream_id, server_stream_id) = if from_client {
            (stream_id, None)
        } else {
            let id = self.next_available_stream_id(false, stream_is_unidirectional(stream_id));
            (id, Some(stream_id))
        };
        let mut stream = QuicStreamLayer::new(self.context.fork(), self.ignore, client_stream_id);
        if let Some(server_stream_id) = server_stream_id {
            stream.open_server_stream(server_stream_id);
            self.server_stream_ids.insert(server_stream_id, client_stream_id);
        }
        let route = Route::Stream(client_stream_id);
        self.connections.insert(stream.client.clone(), route);
        self.connections.insert(stream.server.clone(), route);
        self.streams.insert(client_stream_id, stream);
        let commands = self.event_to_child(route, Event::Start);
        out.extend(commands);
        client_stream_id
    }

    fn stream_conn(&self, id: u64, client: bool) -> Option<ConnectionRef> {
        let stream = self.streams.get(&id)?;
        Some(if client {
            stream.client.clone()
        } else {
            stream.server.clone()
        })
    }

    fn stream_event(&mut self, event: Event, out: &mut Commands) {
        let from_client = event.concerns(&self.context.client);
        let Some(stream_id) = event.stream_id() else {
            return;
        };
        let id = self.stream_for(from_client, stream_id, out);
        let Some(conn) = self.stream_conn(id, from_client) else {
            return;
        };
        match event {
            Event::QuicStreamDataReceived {
                data, end_stream, ..
            } => {
                if !data.is_empty() {
                    let commands = self.event_to_child(Route::Stream(id), Event::data(&conn, data));
                    out.extend(commands);
                }
                if end_stream {
                    let commands = self.close_stream_layer(id, from_client);
                    out.extend(commands);
                }
            }
            Event::QuicStreamReset { error_code, .. } => {
                let peer_stream = self.streams.get(&id).and_then(|s| s.stream_id(!from_client));
                // A bare FIN in answer to a reset is turned into a reset of the peer stream.
                for command in self.close_stream_layer(id, from_client) {
                    match &command.kind {
                        CommandKind::SendQuicStreamData {
                            connection,
                            stream_id,
                            data,
                            end_stream: true,
                        } if Some(*stream_id) == peer_stream && data.is_empty() => {
                            out.push(Command::reset_stream(connection, *stream_id, error_code));
                        }
                        _ => out.push(command),
                    }
                }
            }
            Event::QuicStreamStopSending { error_code, .. } => {
                // The peer no longer reads this stream. Stop writing and tell it so.
                let writable = {
                    let mut conn = conn.lock();
                    let writable = conn.state.contains(ConnectionState::CAN_WRITE);
                    conn.state = conn.state.without(ConnectionState::CAN_WRITE);
                    writable
                };
                if writable {
                    let quic_conn = self.quic_conn(from_client);
                    out.push(Command::reset_stream(&quic_conn, stream_id, error_code));
                }
            }
            _ => {}
        }
    }

    fn quic_conn(&self, client: bool) -> ConnectionRef {
        if client {
            self.context.client.clone()
        } else {
            self.context.server.clone()
        }
    }

    fn connection_closed(
        &mut self,
        connection: ConnectionRef,
        error_code: u64,
        frame_type: Option<u64>,
        reason: String,
        out: &mut Commands,
    ) -> Step<Self> {
        let from_client = connection == self.context.client;
        let other = self.quic_conn(!from_client);
        let step = if other.connected() {
            let close = Command::close_quic_connection(&other, error_code, frame_type, reason);
            Step::emit(close, out).map(|_| ())
        } else {
            self.done = true;
            Step::done()
        };
        step.then(self, out, move |this: &mut Self, out, ()| {
            this.close_datagrams(&connection, &other, out);
            this.close_streams(from_client, out);
            Step::done()
        })
    }

    /// The datagram child sees a regular close. Closing the other side is already taken care
    /// of, so its close command is answered here.
    fn close_datagrams(&mut self, connection: &ConnectionRef, other: &ConnectionRef, out: &mut Commands) {
        let mut pending = self.event_to_child(Route::Datagrams, Event::closed(connection));
        loop {
            let mut swallowed = None;
            for command in pending.drain(..) {
                match &command.kind {
                    CommandKind::CloseConnection { connection, .. } if connection == other => {
                        self.command_sources.remove(&command.id());
                        swallowed = Some(command);
                    }
                    _ => out.push(command),
                }
            }
            match swallowed {
                Some(command) => {
                    pending = self.event_to_child(Route::Datagrams, Event::completed(command, None));
                }
                None => break,
            }
        }
    }

    fn close_streams(&mut self, from_client: bool, out: &mut Commands) {
        let ids: Vec<u64> = self.streams.keys().copied().collect();
        for id in ids {
            if let Some(conn) = self.stream_conn(id, from_client) {
                let mut conn = conn.lock();
                conn.state = conn.state.without(ConnectionState::CAN_WRITE);
            }
            for command in self.close_stream_layer(id, from_client) {
                let empty_send = matches!(
                    &command.kind,
                    CommandKind::SendQuicStreamData { data, .. } if data.is_empty()
                );
                if !empty_send {
                    out.push(command);
                }
            }
        }
    }

    /// Closes the incoming half of one side of a stream.
    fn close_stream_layer(&mut self, id: u64, client: bool) -> Commands {
        let Some(conn) = self.stream_conn(id, client) else {
            return Vec::new();
        };
        let ended = {
            let mut conn = conn.lock();
            conn.state = conn.state.without(ConnectionState::CAN_READ);
            if conn.timestamp_start.is_some() && conn.timestamp_end.is_none() {
                conn.timestamp_end = Some(Utc::now());
                true
            } else {
                false
            }
        };
        if ended {
            self.event_to_child(Route::Stream(id), Event::closed(&conn))
        } else {
            Vec::new()
        }
    }

    /// Hands `event` to a child and translates what it answers.
    fn event_to_child(&mut self, route: Route, event: Event) -> Commands {
        let commands = match route {
            Route::Datagrams => self.datagram_layer.handle_event(event),
            Route::Stream(id) => match self.streams.get_mut(&id) {
                Some(stream) => stream.handle_event(event),
                None => return Vec::new(),
            },
        };
        let mut out = Vec::new();
        for command in commands {
            if let Route::Stream(id) = route {
                if let Some(to_client) = self.stream_target(id, &command) {
                    self.stream_command(id, to_client, command, &mut out);
                    continue;
                }
            }
            if command.is_blocking() || matches!(command.kind, CommandKind::RequestWakeup { .. }) {
                self.command_sources.insert(command.id(), route);
            }
            if let CommandKind::OpenConnection { connection } = &command.kind {
                self.connections.insert(connection.clone(), route);
            }
            out.push(command);
        }
        out
    }

    /// `Some(true)` for commands to the stream's virtual client, `Some(false)` for its server.
    fn stream_target(&self, id: u64, command: &Command) -> Option<bool> {
        let stream = self.streams.get(&id)?;
        let connection = command.connection()?;
        if *connection == stream.client {
            Some(true)
        } else if *connection == stream.server {
            Some(false)
        } else {
            None
        }
    }

    fn stream_command(&mut self, id: u64, to_client: bool, command: Command, out: &mut Commands) {
        let Some(stream) = self.streams.get(&id) else {
            return;
        };
        let conn = if to_client {
            stream.client.clone()
        } else {
            stream.server.clone()
        };
        let client_stream_id = stream.stream_id(true);
        let stream_id = stream.stream_id(to_client);
        let quic_conn = self.quic_conn(to_client);
        let writable = || conn.state().contains(ConnectionState::CAN_WRITE);

        match &command.kind {
            CommandKind::SendData { data, .. } => {
                let Some(stream_id) = stream_id else {
                    panic!("{}: {} before the stream was opened", Self::NAME, command);
                };
                if writable() {
                    out.push(Command::send_stream_data(&quic_conn, stream_id, data.clone(), false));
                }
            }
            CommandKind::CloseConnection { half_close, .. } => {
                let Some(stream_id) = stream_id else {
                    panic!("{}: {} before the stream was opened", Self::NAME, command);
                };
                let half_close = *half_close;
                if writable() {
                    conn.set_state(conn.state().without(ConnectionState::CAN_WRITE));
                    out.push(Command::send_stream_data(&quic_conn, stream_id, Bytes::new(), true));
                }
                // The close is complete once the FIN is queued.
                out.extend(self.event_to_child(Route::Stream(id), Event::completed(command, None)));
                if !half_close {
                    if stream_is_client_initiated(stream_id) == to_client
                        || !stream_is_unidirectional(stream_id)
                    {
                        out.push(Command::stop_sending_stream(&quic_conn, stream_id, NO_ERROR));
                    }
                    out.extend(self.close_stream_layer(id, to_client));
                }
            }
            CommandKind::OpenConnection { .. } => {
                assert!(!to_client, "{}: cannot open a stream client", Self::NAME);
                assert!(stream_id.is_none(), "{}: stream {} opened twice", Self::NAME, id);
                let uni = client_stream_id.is_some_and(stream_is_unidirectional);
                let server_stream_id = self.next_available_stream_id(true, uni);
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.open_server_stream(server_stream_id);
                }
                self.server_stream_ids.insert(server_stream_id, id);
                out.extend(self.event_to_child(Route::Stream(id), Event::completed(command, None)));
            }
            _ => panic!("{}: unexpected stream command {}", Self::NAME, command),
        }
    }
}

impl Logic for RawQuicLayer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        if self.done {
            return Step::done();
        }
        match event {
            Event::Start => self.start(out),
            Event::CommandCompleted { command, reply } => {
                let Some(route) = self.command_sources.remove(&command.id()) else {
                    panic!("{}: completion of unknown command {}", Self::NAME, command);
                };
                let commands = self.event_to_child(route, Event::completed(command, reply));
                out.extend(commands);
                Step::done()
            }
            // Only the layer owning the flow acts on it.
            event @ Event::MessageInjected { .. } => {
                let mut routes = vec![Route::Datagrams];
                routes.extend(self.streams.keys().map(|id| Route::Stream(*id)));
                for route in routes {
                    let commands = self.event_to_child(route, event.clone());
                    out.extend(commands);
                }
                Step::done()
            }
            event @ (Event::QuicStreamDataReceived { .. }
            | Event::QuicStreamReset { .. }
            | Event::QuicStreamStopSending { .. })
                if event.concerns(&self.context.client) || event.concerns(&self.context.server) =>
            {
                self.stream_event(event, out);
                Step::done()
            }
            Event::QuicConnectionClosed {
                connection,
                error_code,
                frame_type,
                reason,
            } if connection == self.context.client || connection == self.context.server => {
                self.connection_closed(connection, error_code, frame_type, reason, out)
            }
            event => {
                let route = event.connection().and_then(|c| self.connections.get(c)).copied();
                let Some(route) = route else {
                    panic!("{}: no layer for {}", Self::NAME, event);
                };
                let commands = self.event_to_child(route, event);
                out.extend(commands);
                Step::done()
            }
        }
    }

    fn describe(&self) -> String {
        format!("{}(streams={})", Self::NAME, self.streams.len())
    }
}
