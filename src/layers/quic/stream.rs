use super::{stream_is_client_initiated, stream_is_unidirectional};
use crate::commands::Command;
use crate::connection::{Connection, ConnectionId, ConnectionRef, ConnectionState, TransportProtocol};
use crate::context::Context;
use crate::events::Event;
use crate::layer::{Layer, NextLayer};
use crate::layers::relay::RelayLayer;
use chrono::Utc;

/// One QUIC stream, presented to its child as a connection pair of its own.
///
/// The virtual `client` and `server` never touch the wire. [`super::RawQuicLayer`] translates
/// commands for them into stream commands on the QUIC connections.
pub struct QuicStreamLayer {
    pub client: ConnectionRef,
    pub server: ConnectionRef,
    client_stream_id: u64,
    server_stream_id: Option<u64>,
    child: Box<dyn Layer>,
}

impl QuicStreamLayer {
    pub const NAME: &'static str = "QuicStreamLayer";

    /// `context` must be a fork. With `ignore` set the stream is relayed as raw TCP.
    pub fn new(context: Context, ignore: bool, stream_id: u64) -> Self {
        let mut client = context.client.snapshot();
        client.id = ConnectionId::new();
        client.transport_protocol = TransportProtocol::Tcp;
        client.state = if !stream_is_unidirectional(stream_id) {
            ConnectionState::OPEN
        } else if stream_is_client_initiated(stream_id) {
            ConnectionState::CAN_READ
        } else {
            ConnectionState::CAN_WRITE
        };
        let client = ConnectionRef::new(client);

        let address = context.server.lock().address().cloned();
        let server = ConnectionRef::new(Connection::server(address));

        let context = context.with_client(client.clone()).with_server(server.clone());
        let child: Box<dyn Layer> = if ignore {
            Box::new(RelayLayer::tcp(context, false))
        } else {
            NextLayer::boxed(context)
        };
        Self {
            client,
            server,
            client_stream_id: stream_id,
            server_stream_id: None,
            child,
        }
    }

    /// Binds the server side to `server_stream_id` and marks it open in the directions the
    /// stream allows.
    pub fn open_server_stream(&mut self, server_stream_id: u64) {
        assert!(
            self.server_stream_id.is_none(),
            "stream {} already has a server stream",
            self.client_stream_id
        );
        self.server_stream_id = Some(server_stream_id);
        let mut server = self.server.lock();
        server.timestamp_start = Some(Utc::now());
        server.state = if !stream_is_unidirectional(server_stream_id) {
            ConnectionState::OPEN
        } else if stream_is_client_initiated(server_stream_id) {
            ConnectionState::CAN_WRITE
        } else {
            ConnectionState::CAN_READ
        };
    }

    pub fn stream_id(&self, client: bool) -> Option<u64> {
        if client {
            Some(self.client_stream_id)
        } else {
            self.server_stream_id
        }
    }

    pub fn is_unidirectional(&self) -> bool {
        stream_is_unidirectional(self.client_stream_id)
    }

    pub fn initiator(&self) -> &'static str {
        if stream_is_client_initiated(self.client_stream_id) {
            "client"
        } else {
            "server"
        }
    }
}

impl Layer for QuicStreamLayer {
    fn handle_event(&mut self, event: Event) -> Vec<Command> {
        self.child.handle_event(event)
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn describe(&self) -> String {
        let server = match self.server_stream_id {
            Some(id) => id.to_string(),
            None => "-".to_string(),
        };
        format!(
            "{}(client={}, server={}, {}):{}",
            Self::NAME,
            self.client_stream_id,
            server,
            self.initiator(),
            self.child.describe()
        )
    }

    fn child_mut(&mut self) -> Option<&mut Box<dyn Layer>> {
        Some(&mut self.child)
    }
}
