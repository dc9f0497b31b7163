//! Events fed into layers.

use crate::commands::{Command, CommandId, CommandKind, Reply};
use crate::connection::ConnectionRef;
use crate::flow::FlowId;
use bytes::Bytes;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Sent once when the layer stack is first driven.
    Start,
    DataReceived {
        connection: ConnectionRef,
        data: Bytes,
    },
    ConnectionClosed {
        connection: ConnectionRef,
    },
    /// A blocking command finished, or a requested wakeup fired.
    CommandCompleted {
        command: Command,
        reply: Reply,
    },
    /// A message injected into an existing flow from outside the proxy.
    MessageInjected {
        flow: FlowId,
        from_client: bool,
        content: Bytes,
    },
    QuicStreamDataReceived {
        connection: ConnectionRef,
        stream_id: u64,
        data: Bytes,
        end_stream: bool,
    },
    QuicStreamReset {
        connection: ConnectionRef,
        stream_id: u64,
        error_code: u64,
    },
    QuicStreamStopSending {
        connection: ConnectionRef,
        stream_id: u64,
        error_code: u64,
    },
    QuicConnectionClosed {
        connection: ConnectionRef,
        error_code: u64,
        frame_type: Option<u64>,
        reason: String,
    },
}

impl Event {
    pub fn data(connection: &ConnectionRef, data: impl Into<Bytes>) -> Self {
        Event::DataReceived {
            connection: connection.clone(),
            data: data.into(),
        }
    }

    pub fn closed(connection: &ConnectionRef) -> Self {
        Event::ConnectionClosed {
            connection: connection.clone(),
        }
    }

    pub fn completed(command: Command, reply: Reply) -> Self {
        Event::CommandCompleted { command, reply }
    }

    /// The connection a connection event concerns.
    pub fn connection(&self) -> Option<&ConnectionRef> {
        match self {
            Event::DataReceived { connection, .. }
            | Event::ConnectionClosed { connection }
            | Event::QuicStreamDataReceived { connection, .. }
            | Event::QuicStreamReset { connection, .. }
            | Event::QuicStreamStopSending { connection, .. }
            | Event::QuicConnectionClosed { connection, .. } => Some(connection),
            Event::Start | Event::CommandCompleted { .. } | Event::MessageInjected { .. } => None,
        }
    }

    pub fn concerns(&self, conn: &ConnectionRef) -> bool {
        self.connection() == Some(conn)
    }

    /// True if this is the completion of the given command.
    pub fn completes(&self, id: CommandId) -> bool {
        matches!(self, Event::CommandCompleted { command, .. } if command.id() == id)
    }

    pub fn is_wakeup(&self) -> bool {
        matches!(
            self,
            Event::CommandCompleted { command, .. }
                if matches!(command.kind, CommandKind::RequestWakeup { .. })
        )
    }

    /// The stream id of a QUIC stream event.
    pub fn stream_id(&self) -> Option<u64> {
        match self {
            Event::QuicStreamDataReceived { stream_id, .. }
            | Event::QuicStreamReset { stream_id, .. }
            | Event::QuicStreamStopSending { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    pub(crate) fn into_reply(self) -> Reply {
        match self {
            Event::CommandCompleted { reply, .. } => reply,
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Start => f.write_str("Start()"),
            Event::DataReceived { connection, data } => {
                write!(f, "DataReceived({}, {})", connection, data.escape_ascii())
            }
            Event::ConnectionClosed { connection } => write!(f, "ConnectionClosed({})", connection),
            Event::CommandCompleted { command, reply } => match reply {
                Some(err) => write!(f, "CommandCompleted({}, {:?})", command, err),
                None => write!(f, "CommandCompleted({})", command),
            },
            Event::MessageInjected {
                flow,
                from_client,
                content,
            } => write!(
                f,
                "MessageInjected({}, from_client={}, {})",
                flow,
                from_client,
                content.escape_ascii()
            ),
            Event::QuicStreamDataReceived {
                connection,
                stream_id,
                data,
                end_stream,
            } => write!(
                f,
                "QuicStreamDataReceived({}, stream={}, {}, end_stream={})",
                connection,
                stream_id,
                data.escape_ascii(),
                end_stream
            ),
            Event::QuicStreamReset {
                connection,
                stream_id,
                error_code,
            } => write!(f, "QuicStreamReset({}, stream={}, code={})", connection, stream_id, error_code),
            Event::QuicStreamStopSending {
                connection,
                stream_id,
                error_code,
            } => write!(
                f,
                "QuicStreamStopSending({}, stream={}, code={})",
                connection, stream_id, error_code
            ),
            Event::QuicConnectionClosed {
                connection,
                error_code,
                reason,
                ..
            } => write!(f, "QuicConnectionClosed({}, code={}, {:?})", connection, error_code, reason),
        }
    }
}
