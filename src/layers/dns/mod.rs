//! DNS over UDP and TCP, correlated by message id.

mod message;

pub use message::{
    classes, pack_name, response_codes, types, unpack_name, DnsMessage, Question, ResourceRecord,
    DEFAULT_TTL,
};

use crate::commands::Command;
use crate::connection::{ConnectionRef, TransportProtocol};
use crate::context::Context;
use crate::error::DnsError;
use crate::events::Event;
use crate::flow::FlowId;
use crate::hooks::{shared, Hook, Shared};
use crate::layer::{Commands, Engine, Logic, Step};
use bytes::{Buf, BytesMut};
use std::collections::{HashMap, VecDeque};
use tracing::Level;

/// One query and its answer.
#[derive(Debug, Clone)]
pub struct DnsFlow {
    pub id: FlowId,
    pub client: ConnectionRef,
    pub server: ConnectionRef,
    pub request: Option<DnsMessage>,
    /// Addons set this in `dns_request` to answer without asking upstream.
    pub response: Option<DnsMessage>,
    pub error: Option<String>,
    pub live: bool,
}

impl DnsFlow {
    pub fn new(client: ConnectionRef, server: ConnectionRef) -> Self {
        Self {
            id: FlowId::new(),
            client,
            server,
            request: None,
            response: None,
            error: None,
            live: true,
        }
    }

    fn pending(&self) -> bool {
        self.live && self.request.is_some() && self.response.is_none() && self.error.is_none()
    }
}

/// Serializes a message for the given transport. TCP messages carry a length prefix.
pub fn pack_message(message: &DnsMessage, transport: TransportProtocol) -> Result<Vec<u8>, DnsError> {
    let packed = message.packed()?;
    match transport {
        TransportProtocol::Udp => Ok(packed),
        TransportProtocol::Tcp => {
            let len = u16::try_from(packed.len()).map_err(|_| DnsError::OutOfBounds {
                field: "message length",
                value: u32::try_from(packed.len()).unwrap_or(u32::MAX),
            })?;
            let mut framed = Vec::with_capacity(packed.len() + 2);
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(&packed);
            Ok(framed)
        }
    }
}

/// Extracts every complete message. UDP data is exactly one message, TCP data is appended to
/// `buf` and complete frames are taken off its front.
pub fn unpack_messages(
    data: &[u8],
    transport: TransportProtocol,
    buf: &mut BytesMut,
) -> Result<Vec<DnsMessage>, DnsError> {
    match transport {
        TransportProtocol::Udp => Ok(vec![DnsMessage::unpack(data)?]),
        TransportProtocol::Tcp => {
            buf.extend_from_slice(data);
            let mut messages = Vec::new();
            while buf.len() >= 2 {
                let len = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
                if buf.len() < len + 2 {
                    break;
                }
                buf.advance(2);
                let frame = buf.split_to(len);
                messages.push(DnsMessage::unpack(&frame)?);
            }
            Ok(messages)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Query,
    Done,
}

pub struct DnsLayer {
    context: Context,
    flows: HashMap<u16, Shared<DnsFlow>>,
    req_buf: BytesMut,
    resp_buf: BytesMut,
    phase: Phase,
}

impl DnsLayer {
    pub fn new(context: Context) -> Engine<Self> {
        Engine::new(
            context.clone(),
            Self {
                context,
                flows: HashMap::new(),
                req_buf: BytesMut::new(),
                resp_buf: BytesMut::new(),
                phase: Phase::Query,
            },
        )
    }

    fn received(&mut self, connection: ConnectionRef, data: &[u8], out: &mut Commands) -> Step<Self> {
        let from_client = connection == self.context.client;
        let transport = connection.lock().transport_protocol;
        let buf = if from_client {
            &mut self.req_buf
        } else {
            &mut self.resp_buf
        };
        match unpack_messages(data, transport, buf) {
            Ok(messages) => self.process(messages.into(), from_client, out),
            Err(e) => {
                out.push(Command::log(
                    format!("{} sent an invalid message: {}", connection, e),
                    Level::INFO,
                ));
                self.phase = Phase::Done;
                Step::emit(Command::close_connection(&connection), out).map(|_| ())
            }
        }
    }

    fn process(
        &mut self,
        mut messages: VecDeque<DnsMessage>,
        from_client: bool,
        out: &mut Commands,
    ) -> Step<Self> {
        while let Some(message) = messages.pop_front() {
            let step = if from_client {
                let flow = self
                    .flows
                    .entry(message.id)
                    .or_insert_with(|| {
                        shared(DnsFlow::new(
                            self.context.client.clone(),
                            self.context.server.clone(),
                        ))
                    })
                    .clone();
                self.handle_request(flow, message, out)
            } else {
                match self.flows.get(&message.id).cloned() {
                    Some(flow) => self.handle_response(flow, message, out),
                    None => {
                        out.push(Command::log(
                            format!(
                                "Dropping DNS response with unknown id {} from {}",
                                message.id, self.context.server
                            ),
                            Level::INFO,
                        ));
                        Step::done()
                    }
                }
            };
            if !step.is_ready() {
                return step.then(self, out, move |this: &mut Self, out, ()| {
                    this.process(messages, from_client, out)
                });
            }
        }
        Step::done()
    }

    fn handle_request(
        &mut self,
        flow: Shared<DnsFlow>,
        message: DnsMessage,
        out: &mut Commands,
    ) -> Step<Self> {
        {
            let mut flow = flow.lock();
            flow.request = Some(message);
            flow.response = None;
            flow.error = None;
        }
        Step::emit(Command::hook(Hook::DnsRequest(flow.clone())), out).then(
            self,
            out,
            move |this: &mut Self, out, _| {
                let answered = flow.lock().response.clone();
                if let Some(response) = answered {
                    return this.handle_response(flow, response, out);
                }
                if this.context.server.lock().address().is_none() {
                    let err = "No hook has set a response and there is no upstream server.";
                    return this.handle_error(flow, err.to_string(), out);
                }
                let open = if this.context.server.connected() {
                    Step::Ready(None)
                } else {
                    Step::emit(Command::open_connection(&this.context.server), out)
                };
                open.then(this, out, move |this: &mut Self, out, err| {
                    if let Some(err) = err {
                        return this.handle_error(flow, err, out);
                    }
                    let server = this.context.server.clone();
                    let transport = server.lock().transport_protocol;
                    let request = flow.lock().request.clone();
                    let packed = request.map(|r| pack_message(&r, transport)).transpose();
                    match packed {
                        Ok(Some(packed)) => {
                            out.push(Command::send_data(&server, packed));
                            Step::done()
                        }
                        Ok(None) => Step::done(),
                        Err(e) => this.handle_error(flow, e.to_string(), out),
                    }
                })
            },
        )
    }

    fn handle_response(
        &mut self,
        flow: Shared<DnsFlow>,
        message: DnsMessage,
        out: &mut Commands,
    ) -> Step<Self> {
        flow.lock().response = Some(message);
        Step::emit(Command::hook(Hook::DnsResponse(flow.clone())), out).then(
            self,
            out,
            move |this: &mut Self, out, _| {
                let response = flow.lock().response.clone();
                let Some(response) = response else {
                    return Step::done();
                };
                let client = this.context.client.clone();
                let transport = client.lock().transport_protocol;
                match pack_message(&response, transport) {
                    Ok(packed) => {
                        out.push(Command::send_data(&client, packed));
                        Step::done()
                    }
                    Err(e) => this.handle_error(flow, e.to_string(), out),
                }
            },
        )
    }

    /// Records the error, lets addons know, then answers the client with SERVFAIL.
    fn handle_error(&mut self, flow: Shared<DnsFlow>, err: String, out: &mut Commands) -> Step<Self> {
        flow.lock().error = Some(err);
        Step::emit(Command::hook(Hook::DnsError(flow.clone())), out).then(
            self,
            out,
            move |this: &mut Self, out, _| {
                let client = this.context.client.clone();
                if client.state().is_closed() {
                    return Step::done();
                }
                let request = flow.lock().request.clone();
                let transport = client.lock().transport_protocol;
                let servfail = request
                    .map(|r| r.fail(response_codes::SERVFAIL))
                    .transpose()
                    .and_then(|m| m.map(|m| pack_message(&m, transport)).transpose());
                match servfail {
                    Ok(Some(packed)) => out.push(Command::send_data(&client, packed)),
                    Ok(None) => {}
                    Err(e) => out.push(Command::log(
                        format!("Cannot answer {} with SERVFAIL: {}", client, e),
                        Level::WARN,
                    )),
                }
                Step::done()
            },
        )
    }

    fn closed(&mut self, connection: ConnectionRef, out: &mut Commands) -> Step<Self> {
        self.phase = Phase::Done;
        let from_client = connection == self.context.client;
        let pending: VecDeque<_> = if from_client {
            VecDeque::new()
        } else {
            self.flows
                .values()
                .filter(|f| f.lock().pending())
                .cloned()
                .collect()
        };
        self.fail_pending(pending, out)
            .then(self, out, move |this: &mut Self, out, ()| {
                for flow in this.flows.values() {
                    flow.lock().live = false;
                }
                let other = if from_client {
                    this.context.server.clone()
                } else {
                    this.context.client.clone()
                };
                if other.connected() {
                    Step::emit(Command::close_connection(&other), out).map(|_| ())
                } else {
                    Step::done()
                }
            })
    }

    fn fail_pending(&mut self, mut flows: VecDeque<Shared<DnsFlow>>, out: &mut Commands) -> Step<Self> {
        while let Some(flow) = flows.pop_front() {
            let step = self.handle_error(flow, "server closed the connection".to_string(), out);
            if !step.is_ready() {
                return step.then(self, out, move |this: &mut Self, out, ()| {
                    this.fail_pending(flows, out)
                });
            }
        }
        Step::done()
    }
}

impl Logic for DnsLayer {
    fn name(&self) -> &'static str {
        "DnsLayer"
    }

    fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        match (self.phase, event) {
            (_, Event::Start) | (_, Event::CommandCompleted { .. }) => Step::done(),
            (Phase::Query, Event::DataReceived { connection, data }) => {
                self.received(connection, &data, out)
            }
            (Phase::Query, Event::ConnectionClosed { connection }) => self.closed(connection, out),
            (Phase::Done, Event::DataReceived { .. } | Event::ConnectionClosed { .. }) => {
                Step::done()
            }
            (_, event) => panic!("DnsLayer: unexpected event {}", event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;
    use crate::connection::ConnectionState;
    use crate::layer::Layer;
    use crate::test_utils::{logs, tctx};
    use std::net::Ipv4Addr;

    fn transport(ctx: &Context, transport: TransportProtocol) {
        ctx.client.lock().transport_protocol = transport;
        ctx.server.lock().transport_protocol = transport;
    }

    fn request() -> DnsMessage {
        DnsMessage::query(42, Question::new("dns.google", types::A))
    }

    fn response() -> DnsMessage {
        request().succeed(vec![ResourceRecord::a("dns.google", Ipv4Addr::new(8, 8, 8, 8))])
    }

    fn wire(message: &DnsMessage, t: TransportProtocol) -> Vec<u8> {
        pack_message(message, t).unwrap()
    }

    fn hook_flow(command: &Command) -> (&'static str, Shared<DnsFlow>) {
        match &command.kind {
            CommandKind::Hook(Hook::DnsRequest(f)) => ("dns_request", f.clone()),
            CommandKind::Hook(Hook::DnsResponse(f)) => ("dns_response", f.clone()),
            CommandKind::Hook(Hook::DnsError(f)) => ("dns_error", f.clone()),
            _ => panic!("expected dns hook, got {}", command),
        }
    }

    #[test]
    fn invalid_messages_close_the_sender() {
        for t in [TransportProtocol::Tcp, TransportProtocol::Udp] {
            let ctx = tctx();
            transport(&ctx, t);
            let mut data = b"Not a DNS packet".to_vec();
            if t == TransportProtocol::Tcp {
                let mut framed = (data.len() as u16).to_be_bytes().to_vec();
                framed.extend_from_slice(&data);
                data = framed;
            }
            let mut layer = DnsLayer::new(ctx.clone());
            let cmds = layer.handle_event(Event::data(&ctx.client, data));
            assert_eq!(
                logs(&cmds),
                vec!["Client(client:1234, state=open) sent an invalid message: question #0: unpack encountered a label of length 99"]
            );
            assert_eq!(
                cmds[1].kind,
                CommandKind::CloseConnection {
                    connection: ctx.client.clone(),
                    half_close: false
                }
            );
            layer.handle_event(Event::completed(cmds[1].clone(), None));
            assert!(layer.handle_event(Event::closed(&ctx.client)).is_empty());
        }
    }

    #[test]
    fn addon_answers_directly() {
        for t in [TransportProtocol::Tcp, TransportProtocol::Udp] {
            let ctx = tctx();
            transport(&ctx, t);
            let mut layer = DnsLayer::new(ctx.clone());
            let cmds = layer.handle_event(Event::data(&ctx.client, wire(&request(), t)));
            let (name, flow) = hook_flow(&cmds[0]);
            assert_eq!(name, "dns_request");
            assert_eq!(flow.lock().request, Some(request()));
            flow.lock().response = Some(response());

            let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
            assert_eq!(hook_flow(&cmds[0]).0, "dns_response");
            let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
            assert_eq!(
                cmds[0].kind,
                CommandKind::SendData {
                    connection: ctx.client.clone(),
                    data: wire(&response(), t).into()
                }
            );
            assert!(layer.handle_event(Event::closed(&ctx.client)).is_empty());
            assert!(!flow.lock().live);
        }
    }

    #[test]
    fn forwards_upstream_and_relays_the_answer() {
        let ctx = tctx();
        transport(&ctx, TransportProtocol::Udp);
        let mut layer = DnsLayer::new(ctx.clone());
        let cmds = layer.handle_event(Event::data(&ctx.client, wire(&request(), TransportProtocol::Udp)));
        let (_, flow) = hook_flow(&cmds[0]);
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert_eq!(
            cmds[0].kind,
            CommandKind::OpenConnection {
                connection: ctx.server.clone()
            }
        );
        ctx.server.set_state(ConnectionState::OPEN);
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert_eq!(
            cmds[0].kind,
            CommandKind::SendData {
                connection: ctx.server.clone(),
                data: wire(&request(), TransportProtocol::Udp).into()
            }
        );

        let cmds = layer.handle_event(Event::data(&ctx.server, wire(&response(), TransportProtocol::Udp)));
        assert_eq!(hook_flow(&cmds[0]).0, "dns_response");
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert!(matches!(&cmds[0].kind, CommandKind::SendData { connection, .. } if *connection == ctx.client));
        assert_eq!(flow.lock().response, Some(response()));

        let cmds = layer.handle_event(Event::closed(&ctx.client));
        assert_eq!(
            cmds[0].kind,
            CommandKind::CloseConnection {
                connection: ctx.server.clone(),
                half_close: false
            }
        );
    }

    #[test]
    fn no_upstream_answers_servfail() {
        let ctx = tctx();
        ctx.server.lock().set_address(None).unwrap();
        let mut layer = DnsLayer::new(ctx.clone());
        let cmds = layer.handle_event(Event::data(&ctx.client, wire(&request(), TransportProtocol::Tcp)));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        let (name, flow) = hook_flow(&cmds[0]);
        assert_eq!(name, "dns_error");
        assert_eq!(
            flow.lock().error.as_deref(),
            Some("No hook has set a response and there is no upstream server.")
        );
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        let servfail = request().fail(response_codes::SERVFAIL).unwrap();
        assert_eq!(
            cmds[0].kind,
            CommandKind::SendData {
                connection: ctx.client.clone(),
                data: wire(&servfail, TransportProtocol::Tcp).into()
            }
        );
        assert!(flow.lock().response.is_none());
    }

    #[test]
    fn failed_upstream_open_answers_servfail() {
        let ctx = tctx();
        let mut layer = DnsLayer::new(ctx.clone());
        let cmds = layer.handle_event(Event::data(&ctx.client, wire(&request(), TransportProtocol::Tcp)));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), Some("UDP no likey today.".into())));
        let (name, flow) = hook_flow(&cmds[0]);
        assert_eq!(name, "dns_error");
        assert_eq!(flow.lock().error.as_deref(), Some("UDP no likey today."));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert!(matches!(&cmds[0].kind, CommandKind::SendData { connection, .. } if *connection == ctx.client));
    }

    #[test]
    fn server_close_fails_pending_queries() {
        let ctx = tctx();
        ctx.server.set_state(ConnectionState::OPEN);
        let mut layer = DnsLayer::new(ctx.clone());
        let cmds = layer.handle_event(Event::data(&ctx.client, wire(&request(), TransportProtocol::Tcp)));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert!(matches!(&cmds[0].kind, CommandKind::SendData { connection, .. } if *connection == ctx.server));

        ctx.server.set_state(ConnectionState::CLOSED);
        let cmds = layer.handle_event(Event::closed(&ctx.server));
        let (name, flow) = hook_flow(&cmds[0]);
        assert_eq!(name, "dns_error");
        assert_eq!(flow.lock().error.as_deref(), Some("server closed the connection"));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert!(matches!(&cmds[0].kind, CommandKind::SendData { connection, .. } if *connection == ctx.client));
        assert_eq!(
            cmds[1].kind,
            CommandKind::CloseConnection {
                connection: ctx.client.clone(),
                half_close: false
            }
        );
    }

    #[test]
    fn resent_queries_reuse_the_flow() {
        let ctx = tctx();
        ctx.server.set_state(ConnectionState::OPEN);
        let mut layer = DnsLayer::new(ctx.clone());
        let cmds = layer.handle_event(Event::data(&ctx.client, wire(&request(), TransportProtocol::Tcp)));
        let (_, first) = hook_flow(&cmds[0]);
        layer.handle_event(Event::completed(cmds[0].clone(), None));

        let mut again = request();
        again.reserved = 4;
        let cmds = layer.handle_event(Event::data(&ctx.client, wire(&again, TransportProtocol::Tcp)));
        let (_, second) = hook_flow(&cmds[0]);
        assert_eq!(first.lock().id, second.lock().id);
        assert_eq!(second.lock().request, Some(again));
    }

    #[test]
    fn unknown_response_ids_are_dropped() {
        let ctx = tctx();
        let mut layer = DnsLayer::new(ctx.clone());
        let cmds = layer.handle_event(Event::data(&ctx.server, wire(&response(), TransportProtocol::Tcp)));
        assert_eq!(cmds.len(), 1);
        assert!(logs(&cmds)[0].starts_with("Dropping DNS response with unknown id 42"));
    }

    #[test]
    fn tcp_frames_split_inside_the_length_prefix() {
        let ctx = tctx();
        let mut layer = DnsLayer::new(ctx.clone());
        let data = wire(&request(), TransportProtocol::Tcp);
        assert!(layer.handle_event(Event::data(&ctx.client, data[..1].to_vec())).is_empty());
        assert!(layer.handle_event(Event::data(&ctx.client, data[1..5].to_vec())).is_empty());
        let cmds = layer.handle_event(Event::data(&ctx.client, data[5..].to_vec()));
        assert_eq!(cmds.len(), 1);
        let (name, flow) = hook_flow(&cmds[0]);
        assert_eq!(name, "dns_request");
        assert_eq!(flow.lock().request, Some(request()));
    }

    #[test]
    fn two_tcp_frames_in_one_read_are_processed_in_order() {
        let ctx = tctx();
        let mut layer = DnsLayer::new(ctx.clone());
        let mut second = request();
        second.id = 43;
        let mut data = wire(&request(), TransportProtocol::Tcp);
        data.extend(wire(&second, TransportProtocol::Tcp));
        let cmds = layer.handle_event(Event::data(&ctx.client, data));
        let (_, flow) = hook_flow(&cmds[0]);
        assert_eq!(flow.lock().request.as_ref().map(|r| r.id), Some(42));
        // answering the first lets the second through
        flow.lock().response = Some(response());
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        let cmds = layer.handle_event(Event::completed(cmds[0].clone(), None));
        assert!(matches!(cmds[0].kind, CommandKind::SendData { .. }));
        let (name, flow) = hook_flow(&cmds[1]);
        assert_eq!(name, "dns_request");
        assert_eq!(flow.lock().request.as_ref().map(|r| r.id), Some(43));
    }
}
