//! Per connection state threaded through every layer.

use crate::connection::{Connection, ConnectionRef};
use crate::layer::LayerId;
use crate::options::Options;
use parking_lot::Mutex;
use std::sync::Arc;

const MAX_DEBUG_MESSAGE: usize = 2048;
const MAX_REPEATED_DEBUG_MESSAGE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    pub id: LayerId,
    pub name: &'static str,
}

/// The layers currently processing events for a context, outermost first.
#[derive(Debug, Clone, Default)]
pub struct LayerRegistry(Arc<Mutex<Vec<LayerEntry>>>);

impl LayerRegistry {
    /// Appends a layer and returns the resulting stack depth.
    pub fn register(&self, id: LayerId, name: &'static str) -> usize {
        let mut layers = self.0.lock();
        layers.push(LayerEntry { id, name });
        layers.len()
    }

    pub fn remove(&self, id: LayerId) {
        self.0.lock().retain(|entry| entry.id != id);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.0.lock().iter().map(|entry| entry.name).collect()
    }

    pub fn last_name(&self) -> Option<&'static str> {
        self.0.lock().last().map(|entry| entry.name)
    }

    fn deep_copy(&self) -> Self {
        Self(Arc::new(Mutex::new(self.0.lock().clone())))
    }
}

/// Formats debug trace lines. Repeats of the previous message collapse to their first line.
#[derive(Debug, Default)]
pub struct DebugTracer {
    last_message: Option<String>,
}

impl DebugTracer {
    pub fn format(&mut self, message: &str, indent: &str) -> String {
        let mut message = truncate(message, MAX_DEBUG_MESSAGE);
        if self.last_message.as_deref() == Some(message.as_str()) {
            let first_line = message.lines().next().unwrap_or("").trim();
            message = truncate(first_line, MAX_REPEATED_DEBUG_MESSAGE);
        } else {
            self.last_message = Some(message.clone());
        }
        message
            .lines()
            .map(|line| format!("{}{}", indent, line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn truncate(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &message[..idx]),
        None => message.to_string(),
    }
}

/// Client and server of one proxied connection, plus the layer stack handling them.
///
/// Clones share everything. Use [`Context::fork`] for an independent server and stack.
#[derive(Clone)]
pub struct Context {
    pub client: ConnectionRef,
    pub server: ConnectionRef,
    pub options: Arc<Options>,
    pub layers: LayerRegistry,
    tracer: Arc<Mutex<DebugTracer>>,
}

impl Context {
    pub fn new(client: ConnectionRef, options: Arc<Options>) -> Self {
        Self {
            client,
            server: ConnectionRef::new(Connection::server(None)),
            options,
            layers: LayerRegistry::default(),
            tracer: Arc::new(Mutex::new(DebugTracer::default())),
        }
    }

    /// Same client, a copy of the server and of the layer stack.
    pub fn fork(&self) -> Self {
        Self {
            client: self.client.clone(),
            server: self.server.deep_copy(),
            options: self.options.clone(),
            layers: self.layers.deep_copy(),
            tracer: self.tracer.clone(),
        }
    }

    pub fn with_server(mut self, server: ConnectionRef) -> Self {
        self.server = server;
        self
    }

    pub fn with_client(mut self, client: ConnectionRef) -> Self {
        self.client = client;
        self
    }

    pub fn trace(&self, message: &str, indent: &str) -> String {
        self.tracer.lock().format(message, indent)
    }

    /// Human readable position in the layer stack, for log messages.
    pub fn stack_pos(&self) -> String {
        self.layers.names().join(" >> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Address, ConnectionState};

    fn context() -> Context {
        let client = ConnectionRef::new(Connection::client(
            Address::new("127.0.0.1", 40000),
            Address::new("127.0.0.1", 8080),
        ));
        let ctx = Context::new(client, Arc::new(Options::default()));
        ctx.server
            .lock()
            .set_address(Some(Address::new("example.com", 80)))
            .unwrap();
        ctx
    }

    #[test]
    fn fork_isolates_server_and_layers() {
        let ctx = context();
        ctx.layers.register(LayerId::next(), "ReverseProxy");
        let forked = ctx.fork();

        assert_eq!(forked.client, ctx.client);
        forked.server.lock().sni = Some("forked.example".into());
        forked.server.set_state(ConnectionState::OPEN);
        assert_eq!(ctx.server.lock().sni, None);
        assert_eq!(ctx.server.state(), ConnectionState::CLOSED);

        ctx.server.lock().error = Some("reset".into());
        assert_eq!(forked.server.lock().error, None);

        forked.layers.register(LayerId::next(), "TcpLayer");
        assert_eq!(ctx.layers.names(), vec!["ReverseProxy"]);
        assert_eq!(forked.stack_pos(), "ReverseProxy >> TcpLayer");
    }

    #[test]
    fn clones_share_connections() {
        let ctx = context();
        let clone = ctx.clone();
        clone.client.lock().sni = Some("shared".into());
        assert_eq!(ctx.client.lock().sni.as_deref(), Some("shared"));
    }

    #[test]
    fn tracer_truncates_and_collapses_repeats() {
        let mut tracer = DebugTracer::default();
        let long = "x".repeat(MAX_DEBUG_MESSAGE + 10);
        let formatted = tracer.format(&long, "");
        assert_eq!(formatted.chars().count(), MAX_DEBUG_MESSAGE + 1);
        assert!(formatted.ends_with('…'));

        let multi = "first line\nsecond line";
        assert_eq!(tracer.format(multi, "  "), "  first line\n  second line");
        assert_eq!(tracer.format(multi, "  "), "  first line");
    }
}
