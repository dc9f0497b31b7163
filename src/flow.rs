//! Flows: the records addons observe through hooks.

use crate::connection::ConnectionRef;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(Uuid);

impl FlowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One chunk of relayed application data.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowMessage {
    pub from_client: bool,
    pub content: Bytes,
    pub timestamp: DateTime<Utc>,
    /// Set by addons to drop the message instead of relaying it.
    pub dropped: bool,
}

impl FlowMessage {
    pub fn new(from_client: bool, content: Bytes) -> Self {
        Self {
            from_client,
            content,
            timestamp: Utc::now(),
            dropped: false,
        }
    }
}

/// A raw TCP or UDP conversation between client and server.
#[derive(Debug, Clone)]
pub struct MessageFlow {
    pub id: FlowId,
    pub client: ConnectionRef,
    pub server: ConnectionRef,
    pub messages: Vec<FlowMessage>,
    pub live: bool,
    pub error: Option<String>,
}

impl MessageFlow {
    pub fn new(client: ConnectionRef, server: ConnectionRef) -> Self {
        Self {
            id: FlowId::new(),
            client,
            server,
            messages: Vec::new(),
            live: true,
            error: None,
        }
    }
}
