//! Hooks: named extension points dispatched to addons.
//!
//! Payloads that addons may change are `Shared`, so the layer that fired the hook sees the
//! changes once the blocking hook completes.

use crate::connection::ConnectionRef;
use crate::flow::MessageFlow;
use crate::layer::NextLayerData;
use crate::layers::dns::DnsFlow;
use crate::layers::quic::QuicTlsData;
use crate::layers::tls::{ClientHelloData, TlsData};
use crate::layers::upstream_proxy::ConnectRequest;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Payload of the server connection hooks.
#[derive(Debug, Clone)]
pub struct ServerConnectionData {
    pub client: ConnectionRef,
    pub server: ConnectionRef,
}

#[derive(Clone)]
pub enum Hook {
    /// Asks addons which layer should handle a connection.
    NextLayer(NextLayerData),
    ClientConnected(ConnectionRef),
    ClientDisconnected(ConnectionRef),
    /// Fired before connecting upstream. Addons may set `server.error` to veto the connect.
    ServerConnect(ServerConnectionData),
    ServerConnected(ServerConnectionData),
    ServerConnectError(ServerConnectionData),
    ServerDisconnected(ServerConnectionData),
    TcpStart(Shared<MessageFlow>),
    TcpMessage(Shared<MessageFlow>),
    TcpEnd(Shared<MessageFlow>),
    TcpError(Shared<MessageFlow>),
    UdpStart(Shared<MessageFlow>),
    UdpMessage(Shared<MessageFlow>),
    UdpEnd(Shared<MessageFlow>),
    UdpError(Shared<MessageFlow>),
    DnsRequest(Shared<DnsFlow>),
    DnsResponse(Shared<DnsFlow>),
    DnsError(Shared<DnsFlow>),
    TlsClientHello(Shared<ClientHelloData>),
    TlsStartClient(Shared<TlsData>),
    TlsStartServer(Shared<TlsData>),
    TlsEstablishedClient(Shared<TlsData>),
    TlsEstablishedServer(Shared<TlsData>),
    TlsFailedClient(Shared<TlsData>),
    TlsFailedServer(Shared<TlsData>),
    QuicStartClient(Shared<QuicTlsData>),
    QuicStartServer(Shared<QuicTlsData>),
    HttpConnectUpstream(Shared<ConnectRequest>),
}

impl Hook {
    pub fn name(&self) -> &'static str {
        match self {
            Hook::NextLayer(_) => "next_layer",
            Hook::ClientConnected(_) => "client_connected",
            Hook::ClientDisconnected(_) => "client_disconnected",
            Hook::ServerConnect(_) => "server_connect",
            Hook::ServerConnected(_) => "server_connected",
            Hook::ServerConnectError(_) => "server_connect_error",
            Hook::ServerDisconnected(_) => "server_disconnected",
            Hook::TcpStart(_) => "tcp_start",
            Hook::TcpMessage(_) => "tcp_message",
            Hook::TcpEnd(_) => "tcp_end",
            Hook::TcpError(_) => "tcp_error",
            Hook::UdpStart(_) => "udp_start",
            Hook::UdpMessage(_) => "udp_message",
            Hook::UdpEnd(_) => "udp_end",
            Hook::UdpError(_) => "udp_error",
            Hook::DnsRequest(_) => "dns_request",
            Hook::DnsResponse(_) => "dns_response",
            Hook::DnsError(_) => "dns_error",
            Hook::TlsClientHello(_) => "tls_clienthello",
            Hook::TlsStartClient(_) => "tls_start_client",
            Hook::TlsStartServer(_) => "tls_start_server",
            Hook::TlsEstablishedClient(_) => "tls_established_client",
            Hook::TlsEstablishedServer(_) => "tls_established_server",
            Hook::TlsFailedClient(_) => "tls_failed_client",
            Hook::TlsFailedServer(_) => "tls_failed_server",
            Hook::QuicStartClient(_) => "quic_start_client",
            Hook::QuicStartServer(_) => "quic_start_server",
            Hook::HttpConnectUpstream(_) => "http_connect_upstream",
        }
    }

    /// Notifications about something that already ended don't wait for addons.
    pub fn blocking(&self) -> bool {
        !matches!(
            self,
            Hook::ClientDisconnected(_)
                | Hook::ServerDisconnected(_)
                | Hook::TcpEnd(_)
                | Hook::UdpEnd(_)
        )
    }
}

/// Hooks compare by name.
impl PartialEq for Hook {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook({})", self.name())
    }
}
