//! Helpers shared by unit tests.

use crate::commands::{Command, CommandKind};
use crate::connection::{Address, Connection, ConnectionRef};
use crate::context::Context;
use crate::events::Event;
use crate::hooks::{shared, Shared};
use crate::layer::{Commands, Engine, Logic, Step};
use crate::options::Options;
use bytes::Bytes;
use std::sync::Arc;
use tracing::Level;

pub fn tctx() -> Context {
    tctx_with(|_| {})
}

pub fn tctx_with(configure: impl FnOnce(&mut Options)) -> Context {
    let mut options = Options::default();
    configure(&mut options);
    let client = ConnectionRef::new(Connection::client(
        Address::new("client", 1234),
        Address::new("127.0.0.1", 8080),
    ));
    let ctx = Context::new(client, Arc::new(options));
    ctx.server
        .lock()
        .set_address(Some(Address::new("address", 22)))
        .expect("server is closed");
    ctx
}

/// Child layer that records every event. The scripted variant also reacts to a few
/// well known payloads.
pub struct Recorder {
    context: Context,
    seen: Shared<Vec<Event>>,
    scripted: bool,
}

impl Recorder {
    pub fn new(context: Context) -> (Engine<Recorder>, Shared<Vec<Event>>) {
        Self::build(context, false)
    }

    pub fn scripted(context: Context) -> (Engine<Recorder>, Shared<Vec<Event>>) {
        Self::build(context, true)
    }

    fn build(context: Context, scripted: bool) -> (Engine<Recorder>, Shared<Vec<Event>>) {
        let seen = shared(Vec::new());
        let logic = Recorder {
            context: context.clone(),
            seen: seen.clone(),
            scripted,
        };
        (Engine::new(context, logic), seen)
    }
}

impl Logic for Recorder {
    fn name(&self) -> &'static str {
        "Recorder"
    }

    fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        self.seen.lock().push(event.clone());
        if !self.scripted {
            return Step::done();
        }
        match event {
            Event::Start => {
                out.push(Command::log(
                    format!("Got start. Server state: {:?}", self.context.server.state()),
                    Level::INFO,
                ));
                Step::done()
            }
            Event::DataReceived { connection, data } => match data.as_ref() {
                b"open" => {
                    let server = self.context.server.clone();
                    Step::emit(Command::open_connection(&server), out).then(
                        self,
                        out,
                        move |_: &mut Self, out, err| {
                            out.push(Command::log(
                                format!("Opened: err={:?}. Server state: {:?}", err, server.state()),
                                Level::INFO,
                            ));
                            Step::done()
                        },
                    )
                }
                b"half-close" => {
                    Step::emit(Command::half_close_connection(&connection), out).map(|_| ())
                }
                other => {
                    let mut reply = other.to_vec();
                    reply.extend_from_slice(b"-reply");
                    out.push(Command::send_data(&connection, Bytes::from(reply)));
                    Step::done()
                }
            },
            Event::ConnectionClosed { connection } => {
                let side = if connection.is_client() { "client" } else { "server" };
                out.push(Command::log(format!("Got {} close.", side), Level::INFO));
                Step::emit(Command::close_connection(&connection), out).map(|_| ())
            }
            _ => Step::done(),
        }
    }
}

/// Log messages among `commands`.
pub fn logs(commands: &[Command]) -> Vec<String> {
    commands
        .iter()
        .filter_map(|c| match &c.kind {
            CommandKind::Log { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Everything but log messages.
pub fn without_logs(commands: Vec<Command>) -> Vec<Command> {
    commands
        .into_iter()
        .filter(|c| !matches!(c.kind, CommandKind::Log { .. }))
        .collect()
}
