//! Layer execution engine
//!
//! A layer consumes [`Event`]s and produces [`Command`]s without doing any I/O itself.
//! Layer logic runs synchronously until it needs an asynchronous answer, such as an opened
//! connection or an addon's verdict. At that point it returns [`Step::Blocked`] carrying the
//! command and a continuation. The [`Engine`] claims the command, parks the continuation and
//! queues every other event until the matching `CommandCompleted` arrives. Queued events are
//! then replayed in arrival order, stopping again at the next block.

use crate::commands::{Blocking, Command, CommandId, CommandKind, Reply};
use crate::context::Context;
use crate::events::Event;
use crate::hooks::{shared, Hook, Shared};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Level;

pub type Commands = Vec<Command>;

/// Continuation of a blocked step, called with the reply to the blocking command.
pub type Resume<L, T> = Box<dyn FnOnce(&mut L, Reply, &mut Commands) -> Step<L, T> + Send>;

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(u64);

impl LayerId {
    pub fn next() -> Self {
        Self(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// Outcome of running a piece of layer logic.
///
/// Non-blocking commands are pushed to the `Commands` buffer as they are produced. A
/// blocking command ends the step: it is returned together with everything that should
/// happen once its reply is known.
#[must_use]
pub enum Step<L, T = ()> {
    Ready(T),
    Blocked(Command, Resume<L, T>),
}

impl<L: 'static> Step<L> {
    pub fn done() -> Self {
        Step::Ready(())
    }
}

impl<L: 'static> Step<L, Reply> {
    /// Emits a command. Blocking commands suspend until their reply arrives, anything else
    /// goes straight to `out` and resolves to `None`.
    pub fn emit(command: Command, out: &mut Commands) -> Self {
        if command.blocking == Blocking::Yes {
            Step::Blocked(
                command,
                Box::new(|_: &mut L, reply: Reply, _: &mut Commands| Step::Ready(reply)),
            )
        } else {
            out.push(command);
            Step::Ready(None)
        }
    }
}

impl<L: 'static, T: 'static> Step<L, T> {
    /// Runs `next` with this step's value, after the reply if this step is blocked.
    pub fn then<U, F>(self, this: &mut L, out: &mut Commands, next: F) -> Step<L, U>
    where
        U: 'static,
        F: FnOnce(&mut L, &mut Commands, T) -> Step<L, U> + Send + 'static,
    {
        match self {
            Step::Ready(value) => next(this, out, value),
            Step::Blocked(command, resume) => Step::Blocked(
                command,
                Box::new(move |this: &mut L, reply: Reply, out: &mut Commands| {
                    resume(this, reply, out).then(this, out, next)
                }),
            ),
        }
    }

    pub fn map<U, F>(self, f: F) -> Step<L, U>
    where
        U: 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            Step::Ready(value) => Step::Ready(f(value)),
            Step::Blocked(command, resume) => Step::Blocked(
                command,
                Box::new(move |this: &mut L, reply: Reply, out: &mut Commands| {
                    resume(this, reply, out).map(f)
                }),
            ),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Step::Ready(_))
    }
}

/// Anything that can sit in a layer stack.
pub trait Layer: Send {
    fn handle_event(&mut self, event: Event) -> Commands;

    fn name(&self) -> &'static str;

    fn describe(&self) -> String {
        self.name().to_string()
    }

    /// The nested layer, for layers that wrap exactly one child.
    fn child_mut(&mut self) -> Option<&mut Box<dyn Layer>> {
        None
    }
}

/// The protocol specific part of a layer, driven by an [`Engine`].
pub trait Logic: Send + Sized + 'static {
    fn name(&self) -> &'static str;

    fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self>;

    fn describe(&self) -> String {
        self.name().to_string()
    }

    fn child_mut(&mut self) -> Option<&mut Box<dyn Layer>> {
        None
    }
}

struct Paused<L> {
    command: CommandId,
    resume: Resume<L, ()>,
}

/// Gives a [`Logic`] blocking semantics, event buffering and debug tracing.
pub struct Engine<L: Logic> {
    id: LayerId,
    context: Context,
    logic: L,
    paused: Option<Paused<L>>,
    queue: VecDeque<Event>,
    debug: Option<String>,
}

impl<L: Logic> Engine<L> {
    /// Wraps `logic` and registers it on the context's layer stack.
    pub fn new(context: Context, logic: L) -> Self {
        let id = LayerId::next();
        let depth = context.layers.register(id, logic.name());
        let debug = context.options.proxy_debug.then(|| "  ".repeat(depth));
        Self {
            id,
            context,
            logic,
            paused: None,
            queue: VecDeque::new(),
            debug,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn logic(&self) -> &L {
        &self.logic
    }

    pub fn logic_mut(&mut self) -> &mut L {
        &mut self.logic
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    /// Number of events held back while paused.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn trace(&self, out: &mut Commands, message: fmt::Arguments<'_>) {
        if let Some(indent) = &self.debug {
            let message = self.context.trace(&message.to_string(), indent);
            out.push(Command::log(message, Level::DEBUG));
        }
    }

    fn run(&mut self, event: Event, out: &mut Commands) {
        let mut produced = Vec::new();
        let step = self.logic.handle(event, &mut produced);
        self.settle(step, produced, out);
    }

    fn resume(&mut self, resume: Resume<L, ()>, reply: Reply, out: &mut Commands) {
        let mut produced = Vec::new();
        let step = resume(&mut self.logic, reply, &mut produced);
        self.settle(step, produced, out);

        while self.paused.is_none() {
            let Some(event) = self.queue.pop_front() else {
                break;
            };
            self.trace(out, format_args!("!> {}", event));
            self.run(event, out);
        }
    }

    fn settle(&mut self, step: Step<L>, produced: Commands, out: &mut Commands) {
        for command in produced {
            assert!(
                command.blocking != Blocking::Yes,
                "{} emitted blocking command {} without suspending",
                self.logic.name(),
                command
            );
            self.pass(command, out);
        }
        if let Step::Blocked(mut command, resume) = step {
            command.blocking = Blocking::Claimed(self.id);
            self.paused = Some(Paused {
                command: command.id(),
                resume,
            });
            self.pass(command, out);
        }
    }

    fn pass(&self, command: Command, out: &mut Commands) {
        if !matches!(command.kind, CommandKind::Log { .. }) {
            self.trace(out, format_args!("<< {}", command));
        }
        out.push(command);
    }
}

impl<L: Logic> Layer for Engine<L> {
    fn handle_event(&mut self, event: Event) -> Commands {
        let mut out = Vec::new();
        self.trace(&mut out, format_args!(">> {}", event));
        match self.paused.take() {
            Some(paused) if event.completes(paused.command) => {
                self.resume(paused.resume, event.into_reply(), &mut out);
            }
            Some(paused) => {
                self.paused = Some(paused);
                self.queue.push_back(event);
            }
            None => self.run(event, &mut out),
        }
        out
    }

    fn name(&self) -> &'static str {
        self.logic.name()
    }

    fn describe(&self) -> String {
        match &self.paused {
            Some(_) => format!("{}(paused)", self.logic.describe()),
            None => self.logic.describe(),
        }
    }

    fn child_mut(&mut self) -> Option<&mut Box<dyn Layer>> {
        self.logic.child_mut()
    }
}

/// Payload of the next layer hook.
///
/// Addons inspect the data received so far and call [`NextLayerData::set_layer`] to pick the
/// layer that takes over.
#[derive(Clone)]
pub struct NextLayerData {
    context: Context,
    client_data: Bytes,
    server_data: Bytes,
    decision: Shared<Option<Box<dyn Layer>>>,
}

impl NextLayerData {
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn data_client(&self) -> &[u8] {
        &self.client_data
    }

    pub fn data_server(&self) -> &[u8] {
        &self.server_data
    }

    pub fn set_layer(&self, layer: Box<dyn Layer>) {
        *self.decision.lock() = Some(layer);
    }

    pub fn has_layer(&self) -> bool {
        self.decision.lock().is_some()
    }

    fn take_layer(&self) -> Option<Box<dyn Layer>> {
        self.decision.lock().take()
    }
}

#[cfg(test)]
impl NextLayerData {
    pub(crate) fn for_test(context: Context, client_data: &[u8]) -> Self {
        Self {
            context,
            client_data: Bytes::copy_from_slice(client_data),
            server_data: Bytes::new(),
            decision: shared(None),
        }
    }

    pub(crate) fn take_for_test(&self) -> Option<Box<dyn Layer>> {
        self.take_layer()
    }
}

struct Undecided {
    context: Context,
    events: Vec<Event>,
    ask_on_start: bool,
    layer: Option<Box<dyn Layer>>,
    debug: bool,
}

impl Undecided {
    fn data(&self, from_client: bool) -> Bytes {
        let conn = if from_client {
            &self.context.client
        } else {
            &self.context.server
        };
        let mut buf = BytesMut::new();
        for event in &self.events {
            if let Event::DataReceived { connection, data } = event {
                if connection == conn {
                    buf.extend_from_slice(data);
                }
            }
        }
        buf.freeze()
    }

    fn ask(&mut self, out: &mut Commands) -> Step<Self> {
        let data = NextLayerData {
            context: self.context.clone(),
            client_data: self.data(true),
            server_data: self.data(false),
            decision: shared(None),
        };
        Step::emit(Command::hook(Hook::NextLayer(data.clone())), out).then(
            self,
            out,
            move |this: &mut Self, out, _| {
                if let Some(mut layer) = data.take_layer() {
                    if this.debug {
                        out.push(Command::log(
                            format!("[nextlayer] {}", layer.describe()),
                            Level::DEBUG,
                        ));
                    }
                    for event in this.events.drain(..) {
                        out.extend(layer.handle_event(event));
                    }
                    this.layer = Some(layer);
                }
                Step::done()
            },
        )
    }
}

impl Logic for Undecided {
    fn name(&self) -> &'static str {
        "NextLayer"
    }

    fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        if let Some(layer) = self.layer.as_mut() {
            out.extend(layer.handle_event(event));
            return Step::done();
        }
        let ask = match &event {
            Event::Start => self.ask_on_start,
            Event::DataReceived { .. } => true,
            _ => false,
        };
        let client_closed = matches!(&event, Event::ConnectionClosed { connection } if *connection == self.context.client);
        self.events.push(event);

        if ask {
            self.ask(out)
        } else if client_closed {
            Step::emit(Command::close_connection(&self.context.client), out).map(|_| ())
        } else {
            Step::done()
        }
    }
}

/// Defers the choice of protocol layer until addons have seen the first bytes.
///
/// Events are recorded until a layer is chosen, then replayed into it in order. From then on
/// every event goes straight to the chosen layer.
pub struct NextLayer {
    engine: Engine<Undecided>,
    delegate: Option<Box<dyn Layer>>,
}

impl NextLayer {
    pub fn new(context: Context, ask_on_start: bool) -> Self {
        let debug = context.options.proxy_debug;
        let engine = Engine::new(
            context.clone(),
            Undecided {
                context: context.clone(),
                events: Vec::new(),
                ask_on_start,
                layer: None,
                debug,
            },
        );
        // Only the chosen layer shows up on the stack.
        context.layers.remove(engine.id());
        Self {
            engine,
            delegate: None,
        }
    }

    pub fn boxed(context: Context) -> Box<dyn Layer> {
        Box::new(Self::new(context, false))
    }

    pub fn data_client(&self) -> Bytes {
        self.engine.logic().data(true)
    }

    pub fn data_server(&self) -> Bytes {
        self.engine.logic().data(false)
    }

    /// The chosen layer, once the decision has been applied.
    pub fn layer(&self) -> Option<&dyn Layer> {
        self.delegate
            .as_deref()
            .or_else(|| self.engine.logic().layer.as_deref())
    }
}

impl Layer for NextLayer {
    fn handle_event(&mut self, event: Event) -> Commands {
        if let Some(layer) = self.delegate.as_mut() {
            return layer.handle_event(event);
        }
        let out = self.engine.handle_event(event);
        if !self.engine.is_paused() {
            self.delegate = self.engine.logic_mut().layer.take();
        }
        out
    }

    fn name(&self) -> &'static str {
        "NextLayer"
    }

    fn describe(&self) -> String {
        match self.layer() {
            Some(layer) => format!("NextLayer:{}", layer.describe()),
            None => "NextLayer:None".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{tctx, Recorder};

    /// Opens the server, then reports each event it sees after the open completed.
    struct Opener {
        server: crate::connection::ConnectionRef,
        seen: Vec<String>,
    }

    impl Logic for Opener {
        fn name(&self) -> &'static str {
            "Opener"
        }

        fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
            match event {
                Event::Start => Step::emit(Command::open_connection(&self.server), out).then(
                    self,
                    out,
                    |this: &mut Self, out, reply| {
                        this.seen.push(format!("opened {:?}", reply));
                        out.push(Command::log("after open", Level::INFO));
                        Step::done()
                    },
                ),
                Event::DataReceived { data, .. } => {
                    self.seen.push(String::from_utf8_lossy(&data).into_owned());
                    if data.as_ref() == b"block" {
                        Step::emit(Command::open_connection(&self.server), out).map(|_| ())
                    } else {
                        Step::done()
                    }
                }
                _ => Step::done(),
            }
        }
    }

    #[test]
    fn paused_layer_queues_events_and_replays_in_order() {
        let ctx = tctx();
        let mut layer = Engine::new(
            ctx.clone(),
            Opener {
                server: ctx.server.clone(),
                seen: Vec::new(),
            },
        );
        let cmds = layer.handle_event(Event::Start);
        assert_eq!(cmds.len(), 1);
        let open = cmds[0].clone();
        assert_eq!(open.blocking, Blocking::Claimed(layer.id()));
        assert!(layer.is_paused());

        assert!(layer.handle_event(Event::data(&ctx.client, "one")).is_empty());
        assert!(layer.handle_event(Event::data(&ctx.client, "block")).is_empty());
        assert!(layer.handle_event(Event::data(&ctx.client, "three")).is_empty());
        assert_eq!(layer.queued(), 3);
        assert!(layer.logic().seen.is_empty());

        // A completion for some other command is queued too.
        let unrelated = Command::open_connection(&ctx.server);
        assert!(layer
            .handle_event(Event::completed(unrelated, None))
            .is_empty());
        assert_eq!(layer.queued(), 4);

        let cmds = layer.handle_event(Event::completed(open, None));
        // "after open" log, then the second open from the "block" event.
        assert_eq!(cmds.len(), 2);
        assert!(matches!(cmds[0].kind, CommandKind::Log { .. }));
        assert!(matches!(cmds[1].kind, CommandKind::OpenConnection { .. }));
        assert_eq!(layer.logic().seen, vec!["opened None", "one", "block"]);
        // "three" and the unrelated completion stay queued behind the new pause.
        assert_eq!(layer.queued(), 2);

        layer.handle_event(Event::completed(cmds[1].clone(), Some("refused".into())));
        assert_eq!(
            layer.logic().seen,
            vec!["opened None", "one", "block", "three"]
        );
        assert!(!layer.is_paused());
        assert_eq!(layer.queued(), 0);
    }

    #[test]
    fn sequential_opens_are_emitted_in_issue_order() {
        struct TwoOpens {
            server: crate::connection::ConnectionRef,
        }
        impl Logic for TwoOpens {
            fn name(&self) -> &'static str {
                "TwoOpens"
            }
            fn handle(&mut self, _event: Event, out: &mut Commands) -> Step<Self> {
                let server = self.server.clone();
                Step::emit(Command::open_connection(&self.server), out).then(
                    self,
                    out,
                    move |this: &mut Self, out, _| {
                        out.push(Command::log("first done", Level::INFO));
                        Step::emit(Command::open_connection(&server), out).then(
                            this,
                            out,
                            |_: &mut Self, out, _| {
                                out.push(Command::log("second done", Level::INFO));
                                Step::done()
                            },
                        )
                    },
                )
            }
        }

        let ctx = tctx();
        let mut layer = Engine::new(
            ctx.clone(),
            TwoOpens {
                server: ctx.server.clone(),
            },
        );
        let first = layer.handle_event(Event::Start);
        assert_eq!(first.len(), 1);
        let second = layer.handle_event(Event::completed(first[0].clone(), None));
        assert_eq!(second.len(), 2);
        assert!(
            matches!(&second[0].kind, CommandKind::Log { message, .. } if message == "first done")
        );
        assert!(matches!(second[1].kind, CommandKind::OpenConnection { .. }));
        assert_ne!(second[1], first[0]);
        let third = layer.handle_event(Event::completed(second[1].clone(), None));
        assert!(
            matches!(&third[..], [c] if matches!(&c.kind, CommandKind::Log { message, .. } if message == "second done"))
        );
    }

    #[test]
    #[should_panic(expected = "without suspending")]
    fn emitting_a_second_blocking_command_is_a_contract_violation() {
        struct Greedy {
            server: crate::connection::ConnectionRef,
        }
        impl Logic for Greedy {
            fn name(&self) -> &'static str {
                "Greedy"
            }
            fn handle(&mut self, _event: Event, out: &mut Commands) -> Step<Self> {
                out.push(Command::open_connection(&self.server));
                Step::emit(Command::open_connection(&self.server), out).map(|_| ())
            }
        }
        let ctx = tctx();
        let mut layer = Engine::new(
            ctx.clone(),
            Greedy {
                server: ctx.server.clone(),
            },
        );
        layer.handle_event(Event::Start);
    }

    #[test]
    fn claimed_commands_pass_through_ancestors() {
        struct Parent {
            child: Box<dyn Layer>,
        }
        impl Logic for Parent {
            fn name(&self) -> &'static str {
                "Parent"
            }
            fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
                out.extend(self.child.handle_event(event));
                Step::done()
            }
        }
        let ctx = tctx();
        let child = Engine::new(
            ctx.clone(),
            Opener {
                server: ctx.server.clone(),
                seen: Vec::new(),
            },
        );
        let child_id = child.id();
        let mut parent = Engine::new(
            ctx.clone(),
            Parent {
                child: Box::new(child),
            },
        );
        let cmds = parent.handle_event(Event::Start);
        assert_eq!(cmds[0].blocking, Blocking::Claimed(child_id));
        assert!(!parent.is_paused());
        // The parent keeps processing while the child waits.
        let cmds = parent.handle_event(Event::completed(cmds[0].clone(), None));
        assert_eq!(cmds.len(), 1);
    }

    #[test]
    fn debug_tracing_indents_by_depth() {
        let ctx = crate::test_utils::tctx_with(|o| o.proxy_debug = true);
        ctx.layers.register(LayerId::next(), "Outer");
        let mut layer = Engine::new(
            ctx.clone(),
            Opener {
                server: ctx.server.clone(),
                seen: Vec::new(),
            },
        );
        let cmds = layer.handle_event(Event::Start);
        let logs: Vec<String> = cmds
            .iter()
            .filter_map(|c| match &c.kind {
                CommandKind::Log { message, level } if *level == Level::DEBUG => {
                    Some(message.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].starts_with("    >> Start()"));
        assert!(logs[1].starts_with("    << OpenConnection("));
    }

    #[test]
    fn next_layer_waits_for_decision_then_replays_everything() {
        let ctx = tctx();
        let mut nl = NextLayer::new(ctx.clone(), false);
        assert!(nl.handle_event(Event::Start).is_empty());

        let cmds = nl.handle_event(Event::data(&ctx.client, "GET / HTTP/1.1\r\n"));
        assert_eq!(cmds.len(), 1);
        let CommandKind::Hook(Hook::NextLayer(data)) = &cmds[0].kind else {
            panic!("expected next layer hook, got {}", cmds[0]);
        };
        assert_eq!(data.data_client(), b"GET / HTTP/1.1\r\n");
        assert!(data.data_server().is_empty());
        let hook = cmds[0].clone();

        // Held back while the hook is outstanding.
        assert!(nl.handle_event(Event::data(&ctx.client, "Host: x\r\n")).is_empty());

        let (recorder, seen) = Recorder::new(ctx.clone());
        data.set_layer(Box::new(recorder));
        nl.handle_event(Event::completed(hook, None));
        assert_eq!(
            *seen.lock(),
            vec![
                Event::Start,
                Event::data(&ctx.client, "GET / HTTP/1.1\r\n"),
                Event::data(&ctx.client, "Host: x\r\n"),
            ]
        );
        assert_eq!(nl.describe(), "NextLayer:Recorder");

        nl.handle_event(Event::data(&ctx.client, "\r\n"));
        assert_eq!(seen.lock().len(), 4);
    }

    #[test]
    fn next_layer_asks_again_without_a_decision() {
        let ctx = tctx();
        let mut nl = NextLayer::new(ctx.clone(), false);
        let cmds = nl.handle_event(Event::data(&ctx.client, "\x16"));
        let hook = cmds[0].clone();
        let cmds = nl.handle_event(Event::completed(hook, None));
        assert!(cmds.is_empty());
        assert!(nl.layer().is_none());

        let cmds = nl.handle_event(Event::data(&ctx.client, "\x03\x01"));
        let CommandKind::Hook(Hook::NextLayer(data)) = &cmds[0].kind else {
            panic!("expected next layer hook");
        };
        assert_eq!(data.data_client(), b"\x16\x03\x01");
        assert_eq!(nl.data_client().as_ref(), b"\x16\x03\x01");
    }

    #[test]
    fn next_layer_closes_client_that_leaves_early() {
        let ctx = tctx();
        let mut nl = NextLayer::new(ctx.clone(), false);
        nl.handle_event(Event::Start);
        let cmds = nl.handle_event(Event::closed(&ctx.client));
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            cmds[0].kind,
            CommandKind::CloseConnection {
                connection: ctx.client.clone(),
                half_close: false
            }
        );
    }

    #[test]
    fn next_layer_is_not_on_the_stack() {
        let ctx = tctx();
        let _nl = NextLayer::new(ctx.clone(), true);
        assert!(ctx.layers.is_empty());
    }
}
