//! Raw TCP and UDP relaying between client and server.

use crate::commands::{Command, Reply};
use crate::connection::{ConnectionRef, ConnectionState, TransportProtocol};
use crate::context::Context;
use crate::events::Event;
use crate::flow::{FlowMessage, MessageFlow};
use crate::hooks::{shared, Hook, Shared};
use crate::layer::{Commands, Engine, Logic, Step};
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Relay,
    Done,
}

/// Relays bytes (TCP) or datagrams (UDP) unchanged unless an addon rewrites them.
///
/// Ignored connections skip every hook.
pub struct RelayLayer {
    context: Context,
    transport: TransportProtocol,
    flow: Option<Shared<MessageFlow>>,
    phase: Phase,
}

impl RelayLayer {
    pub fn tcp(context: Context, ignore: bool) -> Engine<Self> {
        Self::build(context, TransportProtocol::Tcp, ignore)
    }

    pub fn udp(context: Context, ignore: bool) -> Engine<Self> {
        Self::build(context, TransportProtocol::Udp, ignore)
    }

    fn build(context: Context, transport: TransportProtocol, ignore: bool) -> Engine<Self> {
        let flow = (!ignore).then(|| {
            shared(MessageFlow::new(
                context.client.clone(),
                context.server.clone(),
            ))
        });
        Engine::new(
            context.clone(),
            Self {
                context,
                transport,
                flow,
                phase: Phase::Start,
            },
        )
    }

    pub fn flow(&self) -> Option<&Shared<MessageFlow>> {
        self.flow.as_ref()
    }

    fn hook(&self, make: fn(Shared<MessageFlow>, bool) -> Hook, out: &mut Commands) -> Step<Self, Reply> {
        match &self.flow {
            Some(flow) => {
                let udp = self.transport == TransportProtocol::Udp;
                Step::emit(Command::hook(make(flow.clone(), udp)), out)
            }
            None => Step::Ready(None),
        }
    }

    fn start(&mut self, out: &mut Commands) -> Step<Self> {
        self.hook(start_hook, out).then(self, out, |this: &mut Self, out, _| {
            if this.context.server.lock().timestamp_start.is_some() {
                this.phase = Phase::Relay;
                return Step::done();
            }
            let server = this.context.server.clone();
            Step::emit(Command::open_connection(&server), out).then(this, out, |this: &mut Self, out, err| {
                let Some(err) = err else {
                    this.phase = Phase::Relay;
                    return Step::done();
                };
                this.phase = Phase::Done;
                if let Some(flow) = &this.flow {
                    flow.lock().error = Some(err);
                }
                this.hook(error_hook, out).then(this, out, |this: &mut Self, out, _| {
                    Step::emit(Command::close_connection(&this.context.client), out).map(|_| ())
                })
            })
        })
    }

    fn peer(&self, connection: &ConnectionRef) -> (bool, ConnectionRef) {
        if *connection == self.context.client {
            (true, self.context.server.clone())
        } else {
            (false, self.context.client.clone())
        }
    }

    fn relay(&mut self, from: ConnectionRef, data: Bytes, out: &mut Commands) -> Step<Self> {
        let (from_client, send_to) = self.peer(&from);
        let Some(flow) = self.flow.clone() else {
            out.push(Command::send_data(&send_to, data));
            return Step::done();
        };
        let index = {
            let mut flow = flow.lock();
            flow.messages.push(FlowMessage::new(from_client, data));
            flow.messages.len() - 1
        };
        self.hook(message_hook, out).then(self, out, move |_: &mut Self, out, _| {
            let message = flow.lock().messages.get(index).cloned();
            if let Some(message) = message.filter(|m| !m.dropped) {
                out.push(Command::send_data(&send_to, message.content));
            }
            Step::done()
        })
    }

    fn closed(&mut self, connection: ConnectionRef, out: &mut Commands) -> Step<Self> {
        let (_, send_to) = self.peer(&connection);
        match self.transport {
            TransportProtocol::Udp => {
                self.phase = Phase::Done;
                Step::emit(Command::close_connection(&send_to), out)
                    .then(self, out, |this: &mut Self, out, _| this.end(out))
            }
            TransportProtocol::Tcp => {
                let can_read = |c: &ConnectionRef| c.state().contains(ConnectionState::CAN_READ);
                if can_read(&self.context.client) || can_read(&self.context.server) {
                    return Step::emit(Command::half_close_connection(&send_to), out).map(|_| ());
                }
                self.phase = Phase::Done;
                let server = self.context.server.clone();
                let client = self.context.client.clone();
                close_if_open(server, out)
                    .then(self, out, move |_: &mut Self, out, _| close_if_open(client, out))
                    .then(self, out, |this: &mut Self, out, _| this.end(out))
            }
        }
    }

    fn end(&mut self, out: &mut Commands) -> Step<Self> {
        self.hook(end_hook, out).map(|_| ())
    }
}

fn close_if_open(conn: ConnectionRef, out: &mut Commands) -> Step<RelayLayer, Reply> {
    if conn.state().is_closed() {
        Step::Ready(None)
    } else {
        Step::emit(Command::close_connection(&conn), out)
    }
}

fn start_hook(flow: Shared<MessageFlow>, udp: bool) -> Hook {
    if udp {
        Hook::UdpStart(flow)
    } else {
        Hook::TcpStart(flow)
    }
}

fn message_hook(flow: Shared<MessageFlow>, udp: bool) -> Hook {
    if udp {
        Hook::UdpMessage(flow)
    } else {
        Hook::TcpMessage(flow)
    }
}

fn end_hook(flow: Shared<MessageFlow>, udp: bool) -> Hook {
    flow.lock().live = false;
    if udp {
        Hook::UdpEnd(flow)
    } else {
        Hook::TcpEnd(flow)
    }
}

fn error_hook(flow: Shared<MessageFlow>, udp: bool) -> Hook {
    if udp {
        Hook::UdpError(flow)
    } else {
        Hook::TcpError(flow)
    }
}

impl Logic for RelayLayer {
    fn name(&self) -> &'static str {
        match self.transport {
            TransportProtocol::Tcp => "TcpLayer",
            TransportProtocol::Udp => "UdpLayer",
        }
    }

    fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        match (self.phase, event) {
            (Phase::Start, Event::Start) => self.start(out),
            (Phase::Relay, Event::DataReceived { connection, data }) => {
                self.relay(connection, data, out)
            }
            (Phase::Relay, Event::ConnectionClosed { connection }) => self.closed(connection, out),
            (
                Phase::Relay,
                Event::MessageInjected {
                    flow,
                    from_client,
                    content,
                },
            ) => {
                let ours = self.flow.as_ref().is_some_and(|f| f.lock().id == flow);
                if !ours {
                    return Step::done();
                }
                let from = if from_client {
                    self.context.client.clone()
                } else {
                    self.context.server.clone()
                };
                self.relay(from, content, out)
            }
            (Phase::Done, _) | (_, Event::CommandCompleted { .. }) => Step::done(),
            (phase, event) => panic!("{}: unexpected event {} in {:?}", self.name(), event, phase),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;
    use crate::layer::Layer;
    use crate::test_utils::tctx;

    fn hook_name(command: &Command) -> Option<&'static str> {
        match &command.kind {
            CommandKind::Hook(hook) => Some(hook.name()),
            _ => None,
        }
    }

    #[test]
    fn opens_server_and_relays_both_ways() {
        let ctx = tctx();
        let mut layer = RelayLayer::tcp(ctx.clone(), false);

        let cmds = layer.handle_event(Event::Start);
        assert_eq!(hook_name(&cmds[0]), Some("tcp_start"));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert_eq!(
            cmds[0].kind,
            CommandKind::OpenConnection {
                connection: ctx.server.clone()
            }
        );
        ctx.server.set_state(ConnectionState::OPEN);
        assert!(layer
            .handle_event(Event::completed(cmds[0].clone(), None))
            .is_empty());

        let cmds = layer.handle_event(Event::data(&ctx.client, "hello"));
        assert_eq!(hook_name(&cmds[0]), Some("tcp_message"));
        let CommandKind::Hook(Hook::TcpMessage(flow)) = &cmds[0].kind else {
            unreachable!()
        };
        flow.lock().messages[0].content = Bytes::from_static(b"HELLO");
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert_eq!(
            cmds[0].kind,
            CommandKind::SendData {
                connection: ctx.server.clone(),
                data: Bytes::from_static(b"HELLO")
            }
        );
        assert_eq!(flow.lock().messages.len(), 1);
    }

    #[test]
    fn ignored_layer_relays_without_hooks() {
        let ctx = tctx();
        ctx.server.lock().timestamp_start = Some(chrono::Utc::now());
        let mut layer = RelayLayer::tcp(ctx.clone(), true);
        assert!(layer.handle_event(Event::Start).is_empty());
        let cmds = layer.handle_event(Event::data(&ctx.server, "pong"));
        assert_eq!(
            cmds[0].kind,
            CommandKind::SendData {
                connection: ctx.client.clone(),
                data: Bytes::from_static(b"pong")
            }
        );
    }

    #[test]
    fn failed_connect_closes_client() {
        let ctx = tctx();
        let mut layer = RelayLayer::tcp(ctx.clone(), false);
        let start = layer.handle_event(Event::Start);
        let open = layer.handle_event(Event::completed(start[0].clone(), None));
        let cmds = layer.handle_event(Event::completed(open[0].clone(), Some("refused".into())));
        assert_eq!(hook_name(&cmds[0]), Some("tcp_error"));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert_eq!(
            cmds[0].kind,
            CommandKind::CloseConnection {
                connection: ctx.client.clone(),
                half_close: false
            }
        );
        let flow = layer.logic().flow().unwrap().clone();
        assert_eq!(flow.lock().error.as_deref(), Some("refused"));
    }

    #[test]
    fn tcp_half_closes_until_both_sides_are_done() {
        let ctx = tctx();
        ctx.server.set_state(ConnectionState::OPEN);
        ctx.server.lock().timestamp_start = Some(chrono::Utc::now());
        let mut layer = RelayLayer::tcp(ctx.clone(), true);
        layer.handle_event(Event::Start);

        ctx.client.set_state(ConnectionState::CAN_WRITE);
        let cmds = layer.handle_event(Event::closed(&ctx.client));
        assert_eq!(
            cmds[0].kind,
            CommandKind::CloseConnection {
                connection: ctx.server.clone(),
                half_close: true
            }
        );
        ctx.server.set_state(ConnectionState::CAN_READ);
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert!(cmds.is_empty());

        ctx.server.set_state(ConnectionState::CLOSED);
        let cmds = layer.handle_event(Event::closed(&ctx.server));
        assert_eq!(
            cmds[0].kind,
            CommandKind::CloseConnection {
                connection: ctx.client.clone(),
                half_close: false
            }
        );
    }

    #[test]
    fn udp_close_ends_flow() {
        let ctx = tctx();
        ctx.server.lock().timestamp_start = Some(chrono::Utc::now());
        let mut layer = RelayLayer::udp(ctx.clone(), false);
        let start = layer.handle_event(Event::Start);
        assert_eq!(hook_name(&start[0]), Some("udp_start"));
        layer.handle_event(Event::completed(start[0].clone(), None));

        let cmds = layer.handle_event(Event::closed(&ctx.server));
        assert_eq!(
            cmds[0].kind,
            CommandKind::CloseConnection {
                connection: ctx.client.clone(),
                half_close: false
            }
        );
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert_eq!(hook_name(&cmds[0]), Some("udp_end"));
        assert!(!cmds[0].is_blocking());
        assert!(!layer.logic().flow().unwrap().lock().live);
    }

    #[test]
    fn injected_messages_reach_the_other_side() {
        let ctx = tctx();
        ctx.server.lock().timestamp_start = Some(chrono::Utc::now());
        let mut layer = RelayLayer::tcp(ctx.clone(), false);
        let start = layer.handle_event(Event::Start);
        layer.handle_event(Event::completed(start[0].clone(), None));
        let id = layer.logic().flow().unwrap().lock().id;

        let cmds = layer.handle_event(Event::MessageInjected {
            flow: id,
            from_client: false,
            content: Bytes::from_static(b"injected"),
        });
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert_eq!(
            cmds[0].kind,
            CommandKind::SendData {
                connection: ctx.client.clone(),
                data: Bytes::from_static(b"injected")
            }
        );
    }
}
