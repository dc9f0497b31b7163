//! Proxy options shared by every layer through the [`crate::context::Context`].

use crate::connection::{Address, ServerSpec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStrategy {
    /// Connect upstream as soon as the destination is known.
    Eager,
    /// Connect upstream only when a layer asks for it.
    Lazy,
}

/// Protocol spoken towards a reverse proxy target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReverseScheme {
    Tcp,
    Tls,
    Dns,
}

impl ReverseScheme {
    pub fn is_secure(self) -> bool {
        matches!(self, ReverseScheme::Tls)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyMode {
    /// Every client is relayed to a fixed target.
    Reverse {
        scheme: ReverseScheme,
        address: Address,
        /// Upstream HTTP proxy the target is reached through.
        #[serde(default)]
        via: Option<ServerSpec>,
    },
    /// Clients were redirected to the proxy. The destination is the address they connected to.
    Transparent {
        #[serde(default)]
        via: Option<ServerSpec>,
    },
}

impl ProxyMode {
    pub fn via(&self) -> Option<&ServerSpec> {
        match self {
            ProxyMode::Reverse { via, .. } | ProxyMode::Transparent { via } => via.as_ref(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProxyMode::Reverse { .. } => "reverse",
            ProxyMode::Transparent { .. } => "transparent",
        }
    }
}

impl Default for ProxyMode {
    fn default() -> Self {
        ProxyMode::Reverse {
            scheme: ReverseScheme::Tcp,
            address: Address::new("127.0.0.1", 8000),
            via: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Trace every event and command passing through the layer stack.
    pub proxy_debug: bool,
    pub connection_strategy: ConnectionStrategy,
    pub mode: ProxyMode,
    /// Hosts relayed without TLS interception, matched in list order.
    pub ignore_hosts: Vec<String>,
    /// Treat every client as a DNS client.
    pub dns_mode: bool,
    /// Add a Host header to CONNECT requests sent to an upstream proxy.
    pub http_connect_send_host_header: bool,
    /// Keep the client's SNI instead of the reverse target's host name.
    pub keep_host_header: bool,
    pub connect_timeout_secs: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            proxy_debug: false,
            connection_strategy: ConnectionStrategy::Eager,
            mode: ProxyMode::default(),
            ignore_hosts: Vec::new(),
            dns_mode: false,
            http_connect_send_host_header: true,
            keep_host_header: false,
            connect_timeout_secs: 10,
        }
    }
}
