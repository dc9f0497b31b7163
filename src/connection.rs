//! Connection model
//!
//! `Connection` is a plain value describing one endpoint. Layers share endpoints through
//! [`ConnectionRef`], whose equality and hash follow the connection id rather than the
//! allocation, so a handle restored from serialized state still compares equal.

use crate::error::{ConnectionError, StateError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Version written by [`Connection::get_state`].
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Host and port of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Read/write capability bitset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionState(u8);

impl ConnectionState {
    pub const CLOSED: Self = Self(0);
    pub const CAN_READ: Self = Self(1);
    pub const CAN_WRITE: Self = Self(2);
    pub const OPEN: Self = Self(3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_closed(self) -> bool {
        self.0 == 0
    }

    /// Returns the state with the given capability removed.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    fn name(self) -> &'static str {
        match self.0 {
            0 => "closed",
            1 => "can_read",
            2 => "can_write",
            _ => "open",
        }
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

/// A DER encoded certificate, serialized as base64.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate(pub Vec<u8>);

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({} bytes)", self.0.len())
    }
}

impl Serialize for Certificate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Certificate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Certificate)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    Http,
    Https,
}

/// An upstream proxy the server connection is relayed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub scheme: UpstreamScheme,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Role {
    Client {
        proxy_mode: String,
    },
    Server {
        address: Option<Address>,
        via: Option<ServerSpec>,
        timestamp_tcp_setup: Option<DateTime<Utc>>,
    },
}

/// One endpoint of a proxied connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub peername: Option<Address>,
    pub sockname: Option<Address>,
    pub state: ConnectionState,
    pub transport_protocol: TransportProtocol,
    pub error: Option<String>,
    pub tls: bool,
    pub certificate_list: Vec<Certificate>,
    pub alpn: Option<Vec<u8>>,
    pub alpn_offers: Vec<Vec<u8>>,
    pub cipher: Option<String>,
    pub cipher_list: Vec<String>,
    pub tls_version: Option<String>,
    pub sni: Option<String>,
    pub timestamp_start: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
    pub timestamp_tls_setup: Option<DateTime<Utc>>,
    pub role: Role,
}

#[derive(Serialize)]
struct VersionedRef<'a> {
    version: u32,
    #[serde(flatten)]
    connection: &'a Connection,
}

#[derive(Deserialize)]
struct Versioned {
    version: u32,
    #[serde(flatten)]
    connection: Connection,
}

impl Connection {
    /// A freshly accepted client. Clients start out open.
    pub fn client(peername: Address, sockname: Address) -> Self {
        Self {
            peername: Some(peername),
            sockname: Some(sockname),
            state: ConnectionState::OPEN,
            timestamp_start: Some(Utc::now()),
            ..Self::blank(Role::Client {
                proxy_mode: "regular".into(),
            })
        }
    }

    /// A server that has not been connected yet.
    pub fn server(address: Option<Address>) -> Self {
        Self::blank(Role::Server {
            address,
            via: None,
            timestamp_tcp_setup: None,
        })
    }

    fn blank(role: Role) -> Self {
        Self {
            id: ConnectionId::new(),
            peername: None,
            sockname: None,
            state: ConnectionState::CLOSED,
            transport_protocol: TransportProtocol::Tcp,
            error: None,
            tls: false,
            certificate_list: Vec::new(),
            alpn: None,
            alpn_offers: Vec::new(),
            cipher: None,
            cipher_list: Vec::new(),
            tls_version: None,
            sni: None,
            timestamp_start: None,
            timestamp_end: None,
            timestamp_tls_setup: None,
            role,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client { .. })
    }

    pub fn connected(&self) -> bool {
        self.state == ConnectionState::OPEN
    }

    pub fn tls_established(&self) -> bool {
        self.timestamp_tls_setup.is_some()
    }

    pub fn address(&self) -> Option<&Address> {
        match &self.role {
            Role::Server { address, .. } => address.as_ref(),
            Role::Client { .. } => None,
        }
    }

    pub fn set_address(&mut self, new: Option<Address>) -> Result<(), ConnectionError> {
        let open = self.connected();
        match &mut self.role {
            Role::Server { address, .. } => {
                if open && *address != new {
                    return Err(ConnectionError::ChangeWhileOpen { field: "address" });
                }
                *address = new;
                Ok(())
            }
            Role::Client { .. } => Err(ConnectionError::NotAServer("address")),
        }
    }

    pub fn via(&self) -> Option<&ServerSpec> {
        match &self.role {
            Role::Server { via, .. } => via.as_ref(),
            Role::Client { .. } => None,
        }
    }

    pub fn set_via(&mut self, new: Option<ServerSpec>) -> Result<(), ConnectionError> {
        let open = self.connected();
        match &mut self.role {
            Role::Server { via, .. } => {
                if open && *via != new {
                    return Err(ConnectionError::ChangeWhileOpen { field: "via" });
                }
                *via = new;
                Ok(())
            }
            Role::Client { .. } => Err(ConnectionError::NotAServer("via")),
        }
    }

    pub fn set_timestamp_tcp_setup(&mut self, at: DateTime<Utc>) {
        if let Role::Server {
            timestamp_tcp_setup,
            ..
        } = &mut self.role
        {
            *timestamp_tcp_setup = Some(at);
        }
    }

    /// Serializable snapshot of every field, tagged with [`STATE_VERSION`].
    pub fn get_state(&self) -> serde_json::Value {
        serde_json::to_value(VersionedRef {
            version: STATE_VERSION,
            connection: self,
        })
        .unwrap_or(serde_json::Value::Null)
    }

    pub fn from_state(state: serde_json::Value) -> Result<Self, StateError> {
        let versioned: Versioned = serde_json::from_value(state)?;
        if versioned.version != STATE_VERSION {
            return Err(StateError::Version(versioned.version));
        }
        Ok(versioned.connection)
    }

    /// Overwrites every field from a serialized state, keeping nothing of the old value.
    pub fn set_state(&mut self, state: serde_json::Value) -> Result<(), StateError> {
        *self = Self::from_state(state)?;
        Ok(())
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = match &self.role {
            Role::Client { .. } => self.peername.as_ref(),
            Role::Server { address, .. } => address.as_ref(),
        };
        let kind = if self.is_client() { "Client" } else { "Server" };
        match endpoint {
            Some(addr) => write!(f, "{}({}, state={}", kind, addr, self.state.name())?,
            None => write!(f, "{}(<no address>, state={}", kind, self.state.name())?,
        }
        if self.tls {
            let version = self.tls_version.as_deref().unwrap_or("unknown");
            write!(f, ", tls={}", version)?;
        }
        if let Some(alpn) = &self.alpn {
            write!(f, ", alpn={}", String::from_utf8_lossy(alpn))?;
        }
        f.write_str(")")
    }
}

/// Shared handle to a [`Connection`].
///
/// Every layer in a context sees the same endpoint through its handle, so state updates made
/// by one layer are visible to all others.
#[derive(Clone)]
pub struct ConnectionRef {
    id: ConnectionId,
    client: bool,
    inner: Arc<Mutex<Connection>>,
}

impl ConnectionRef {
    pub fn new(connection: Connection) -> Self {
        Self {
            id: connection.id,
            client: connection.is_client(),
            inner: Arc::new(Mutex::new(connection)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().connected()
    }

    pub fn snapshot(&self) -> Connection {
        self.inner.lock().clone()
    }

    /// Copies the connection into new storage. The copy keeps the id.
    pub fn deep_copy(&self) -> Self {
        Self::new(self.snapshot())
    }
}

impl PartialEq for ConnectionRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionRef {}

impl Hash for ConnectionRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(conn) => conn.fmt(f),
            None => {
                let kind = if self.client { "Client" } else { "Server" };
                write!(f, "{}({})", kind, self.id)
            }
        }
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
