//! Commands emitted by layers and executed by the host runtime or an ancestor layer.

use crate::connection::ConnectionRef;
use crate::hooks::Hook;
use crate::layer::LayerId;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::Level;

/// Answer to a blocking command: `None` on success, an error description otherwise.
pub type Reply = Option<String>;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a command. Completions are matched against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(u64);

impl CommandId {
    fn next() -> Self {
        Self(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Whether the issuing layer waits for a `CommandCompleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    No,
    /// Requested, not yet taken over by an engine.
    Yes,
    /// The given layer's engine is paused on this command. Ancestors pass it through.
    Claimed(LayerId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    SendData {
        connection: ConnectionRef,
        data: Bytes,
    },
    OpenConnection {
        connection: ConnectionRef,
    },
    CloseConnection {
        connection: ConnectionRef,
        /// Only close the write side (TCP FIN).
        half_close: bool,
    },
    SendQuicStreamData {
        connection: ConnectionRef,
        stream_id: u64,
        data: Bytes,
        end_stream: bool,
    },
    ResetQuicStream {
        connection: ConnectionRef,
        stream_id: u64,
        error_code: u64,
    },
    StopSendingQuicStream {
        connection: ConnectionRef,
        stream_id: u64,
        error_code: u64,
    },
    CloseQuicConnection {
        connection: ConnectionRef,
        error_code: u64,
        frame_type: Option<u64>,
        reason: String,
    },
    Log {
        message: String,
        level: Level,
    },
    Hook(Hook),
    RequestWakeup {
        delay: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct Command {
    id: CommandId,
    pub blocking: Blocking,
    pub kind: CommandKind,
}

impl Command {
    fn with(kind: CommandKind, blocking: bool) -> Self {
        Self {
            id: CommandId::next(),
            blocking: if blocking { Blocking::Yes } else { Blocking::No },
            kind,
        }
    }

    pub fn send_data(connection: &ConnectionRef, data: impl Into<Bytes>) -> Self {
        Self::with(
            CommandKind::SendData {
                connection: connection.clone(),
                data: data.into(),
            },
            false,
        )
    }

    pub fn open_connection(connection: &ConnectionRef) -> Self {
        Self::with(
            CommandKind::OpenConnection {
                connection: connection.clone(),
            },
            true,
        )
    }

    pub fn close_connection(connection: &ConnectionRef) -> Self {
        Self::with(
            CommandKind::CloseConnection {
                connection: connection.clone(),
                half_close: false,
            },
            true,
        )
    }

    pub fn half_close_connection(connection: &ConnectionRef) -> Self {
        Self::with(
            CommandKind::CloseConnection {
                connection: connection.clone(),
                half_close: true,
            },
            true,
        )
    }

    pub fn send_stream_data(
        connection: &ConnectionRef,
        stream_id: u64,
        data: impl Into<Bytes>,
        end_stream: bool,
    ) -> Self {
        Self::with(
            CommandKind::SendQuicStreamData {
                connection: connection.clone(),
                stream_id,
                data: data.into(),
                end_stream,
            },
            false,
        )
    }

    pub fn reset_stream(connection: &ConnectionRef, stream_id: u64, error_code: u64) -> Self {
        Self::with(
            CommandKind::ResetQuicStream {
                connection: connection.clone(),
                stream_id,
                error_code,
            },
            false,
        )
    }

    pub fn stop_sending_stream(connection: &ConnectionRef, stream_id: u64, error_code: u64) -> Self {
        Self::with(
            CommandKind::StopSendingQuicStream {
                connection: connection.clone(),
                stream_id,
                error_code,
            },
            false,
        )
    }

    pub fn close_quic_connection(
        connection: &ConnectionRef,
        error_code: u64,
        frame_type: Option<u64>,
        reason: impl Into<String>,
    ) -> Self {
        Self::with(
            CommandKind::CloseQuicConnection {
                connection: connection.clone(),
                error_code,
                frame_type,
                reason: reason.into(),
            },
            true,
        )
    }

    pub fn log(message: impl Into<String>, level: Level) -> Self {
        Self::with(
            CommandKind::Log {
                message: message.into(),
                level,
            },
            false,
        )
    }

    pub fn hook(hook: Hook) -> Self {
        let blocking = hook.blocking();
        Self::with(CommandKind::Hook(hook), blocking)
    }

    pub fn request_wakeup(delay: Duration) -> Self {
        Self::with(CommandKind::RequestWakeup { delay }, false)
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking != Blocking::No
    }

    /// The connection a connection command targets.
    pub fn connection(&self) -> Option<&ConnectionRef> {
        match &self.kind {
            CommandKind::SendData { connection, .. }
            | CommandKind::OpenConnection { connection }
            | CommandKind::CloseConnection { connection, .. }
            | CommandKind::SendQuicStreamData { connection, .. }
            | CommandKind::ResetQuicStream { connection, .. }
            | CommandKind::StopSendingQuicStream { connection, .. }
            | CommandKind::CloseQuicConnection { connection, .. } => Some(connection),
            CommandKind::Log { .. } | CommandKind::Hook(_) | CommandKind::RequestWakeup { .. } => {
                None
            }
        }
    }

    /// Retargets a connection command. The command keeps its identity.
    pub fn set_connection(&mut self, target: ConnectionRef) {
        match &mut self.kind {
            CommandKind::SendData { connection, .. }
            | CommandKind::OpenConnection { connection }
            | CommandKind::CloseConnection { connection, .. }
            | CommandKind::SendQuicStreamData { connection, .. }
            | CommandKind::ResetQuicStream { connection, .. }
            | CommandKind::StopSendingQuicStream { connection, .. }
            | CommandKind::CloseQuicConnection { connection, .. } => *connection = target,
            CommandKind::Log { .. } | CommandKind::Hook(_) | CommandKind::RequestWakeup { .. } => {}
        }
    }

    pub fn targets(&self, conn: &ConnectionRef) -> bool {
        self.connection() == Some(conn)
    }
}

/// Commands compare by identity.
impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Command {}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CommandKind::SendData { connection, data } => {
                write!(f, "SendData({}, {})", connection, data.escape_ascii())
            }
            CommandKind::OpenConnection { connection } => write!(f, "OpenConnection({})", connection),
            CommandKind::CloseConnection {
                connection,
                half_close,
            } => {
                if *half_close {
                    write!(f, "CloseConnection({}, half_close)", connection)
                } else {
                    write!(f, "CloseConnection({})", connection)
                }
            }
            CommandKind::SendQuicStreamData {
                connection,
                stream_id,
                data,
                end_stream,
            } => write!(
                f,
                "SendQuicStreamData({}, stream={}, {}, end_stream={})",
                connection,
                stream_id,
                data.escape_ascii(),
                end_stream
            ),
            CommandKind::ResetQuicStream {
                connection,
                stream_id,
                error_code,
            } => write!(f, "ResetQuicStream({}, stream={}, code={})", connection, stream_id, error_code),
            CommandKind::StopSendingQuicStream {
                connection,
                stream_id,
                error_code,
            } => write!(
                f,
                "StopSendingQuicStream({}, stream={}, code={})",
                connection, stream_id, error_code
            ),
            CommandKind::CloseQuicConnection {
                connection,
                error_code,
                reason,
                ..
            } => write!(f, "CloseQuicConnection({}, code={}, {:?})", connection, error_code, reason),
            CommandKind::Log { message, level } => write!(f, "Log({}, {:?})", level, message),
            CommandKind::Hook(hook) => write!(f, "{:?}", hook),
            CommandKind::RequestWakeup { delay } => write!(f, "RequestWakeup({:?})", delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    #[test]
    fn connection_lifecycle_commands_block() {
        let server = ConnectionRef::new(Connection::server(None));
        assert_eq!(Command::open_connection(&server).blocking, Blocking::Yes);
        assert_eq!(Command::close_connection(&server).blocking, Blocking::Yes);
        assert_eq!(Command::send_data(&server, "x").blocking, Blocking::No);
        assert_eq!(
            Command::request_wakeup(Duration::from_millis(5)).blocking,
            Blocking::No
        );
    }

    #[test]
    fn retargeting_keeps_identity() {
        let a = ConnectionRef::new(Connection::server(None));
        let b = ConnectionRef::new(Connection::server(None));
        let original = Command::close_connection(&a);
        let mut rewritten = original.clone();
        rewritten.set_connection(b.clone());
        assert_eq!(rewritten, original);
        assert!(rewritten.targets(&b));
        assert!(!rewritten.targets(&a));
    }
}
