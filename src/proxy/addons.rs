//! Addons answer hooks fired by the layers.
//!
//! The built-in ones decide which protocol layer takes over a connection and hand TLS sessions
//! to the TLS layers.

use crate::connection::TransportProtocol;
use crate::context::Context;
use crate::hooks::{Hook, Shared};
use crate::layer::{Layer, NextLayerData};
use crate::layers::dns::DnsLayer;
use crate::layers::quic::{system_clock, ClientQuic, RawQuicLayer, ServerQuic};
use crate::layers::relay::RelayLayer;
use crate::layers::tls::{parse_client_hello, ClientHelloData, ClientTls, RustlsSession, ServerTls, TlsData};
use crate::layers::upstream_proxy::HttpUpstreamProxy;
use crate::options::{ConnectionStrategy, Options, ProxyMode, ReverseScheme};
use crate::proxy::cert_manager::CertManager;
use crate::tunnel::LayerStack;
use anyhow::Context as _;
use regex::Regex;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use webpki_roots::TLS_SERVER_ROOTS;

const DNS_PORT: u16 = 53;

pub trait Addon: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called for every hook. Blocking hooks complete once all addons returned.
    fn handle_hook(&self, hook: &Hook);
}

/// Addons in dispatch order.
#[derive(Clone, Default)]
pub struct Addons {
    addons: Vec<Arc<dyn Addon>>,
}

impl Addons {
    pub fn new() -> Self {
        Self::default()
    }

    /// The addons every proxy runs with: layer selection, then TLS configuration.
    pub fn standard(options: &Options, cert_manager: Arc<CertManager>) -> anyhow::Result<Self> {
        let mut addons = Self::new();
        addons.add(NextLayerAddon::new(options)?);
        addons.add(TlsConfigAddon::new(cert_manager));
        Ok(addons)
    }

    pub fn add(&mut self, addon: impl Addon + 'static) {
        self.addons.push(Arc::new(addon));
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    pub fn dispatch(&self, hook: &Hook) {
        tracing::trace!(hook = hook.name(), "dispatching hook");
        for addon in &self.addons {
            addon.handle_hook(hook);
        }
    }
}

fn looks_like_tls(data: &[u8]) -> Option<bool> {
    match data {
        [] => None,
        [0x16] | [0x16, 0x03] => None,
        [0x16, 0x03, minor, ..] => Some(*minor <= 0x03),
        _ => Some(false),
    }
}

/// Long header packet of QUIC version 1.
fn looks_like_quic_initial(data: &[u8]) -> bool {
    data.len() >= 5 && data[0] & 0xc0 == 0xc0 && data[1..5] == [0, 0, 0, 1]
}

/// Picks the protocol layer for each connection from its first bytes.
pub struct NextLayerAddon {
    ignore_hosts: Vec<Regex>,
    intercept_quic: bool,
}

impl NextLayerAddon {
    pub fn new(options: &Options) -> anyhow::Result<Self> {
        let ignore_hosts = options
            .ignore_hosts
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("Invalid ignore_hosts pattern {:?}", pattern))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            ignore_hosts,
            intercept_quic: false,
        })
    }

    /// Intercept QUIC instead of relaying it as plain UDP. Some other addon must then provide
    /// sessions in the `quic_start_*` hooks.
    pub fn with_quic_interception(mut self) -> Self {
        self.intercept_quic = true;
        self
    }

    fn ignored(&self, ctx: &Context, sni: Option<&str>) -> bool {
        if self.ignore_hosts.is_empty() {
            return false;
        }
        let address = ctx.server.lock().address().cloned();
        let mut candidates = Vec::new();
        if let Some(address) = address {
            candidates.push(address.to_string());
            if let Some(sni) = sni {
                candidates.push(format!("{}:{}", sni, address.port));
            }
        } else if let Some(sni) = sni {
            candidates.push(sni.to_string());
        }
        candidates
            .iter()
            .any(|host| self.ignore_hosts.iter().any(|re| re.is_match(host)))
    }

    fn is_dns(&self, ctx: &Context) -> bool {
        match &ctx.options.mode {
            ProxyMode::Reverse { scheme, .. } if *scheme == ReverseScheme::Dns => true,
            _ if ctx.options.dns_mode => true,
            ProxyMode::Transparent { .. } => {
                ctx.client.lock().transport_protocol == TransportProtocol::Udp
                    && ctx.server.lock().address().map(|a| a.port) == Some(DNS_PORT)
            }
            _ => false,
        }
    }

    /// Wants TLS towards the server as well as towards the client.
    fn server_tls(ctx: &Context) -> bool {
        match &ctx.options.mode {
            ProxyMode::Reverse { scheme, .. } => scheme.is_secure(),
            ProxyMode::Transparent { .. } => true,
        }
    }

    /// The upstream proxy layers, unless an outer layer already tunnels through it.
    fn upstream(ctx: &Context) -> LayerStack {
        if ctx.layers.names().contains(&HttpUpstreamProxy::NAME) {
            return LayerStack::new();
        }
        HttpUpstreamProxy::make(ctx, true).unwrap_or_default()
    }

    fn tcp(&self, ctx: &Context, ignore: bool) -> Box<dyn Layer> {
        let mut stack = Self::upstream(ctx);
        stack.push(Box::new(RelayLayer::tcp(ctx.clone(), ignore)));
        finish(stack)
    }

    fn tls(&self, ctx: &Context) -> Box<dyn Layer> {
        let mut stack = Self::upstream(ctx);
        if Self::server_tls(ctx) {
            stack.push(Box::new(ServerTls::layer(ctx.clone(), None)));
        }
        stack.push(Box::new(ClientTls::layer(ctx.clone())));
        finish(stack)
    }

    fn quic(&self, ctx: &Context) -> Box<dyn Layer> {
        let mut stack = LayerStack::new();
        stack.push(Box::new(ServerQuic::layer(ctx.clone(), None, system_clock())));
        stack.push(Box::new(ClientQuic::layer(ctx.clone(), system_clock())));
        stack.push(Box::new(RawQuicLayer::new(ctx.clone(), false)));
        finish(stack)
    }

    fn decide(&self, data: &NextLayerData) -> Option<Box<dyn Layer>> {
        let ctx = data.context();
        let transport = ctx.client.lock().transport_protocol;

        if self.is_dns(ctx) {
            return Some(Box::new(DnsLayer::new(ctx.clone())));
        }
        if transport == TransportProtocol::Udp {
            let client_data = data.data_client();
            if self.ignored(ctx, None) {
                return Some(Box::new(RelayLayer::udp(ctx.clone(), true)));
            }
            if self.intercept_quic && looks_like_quic_initial(client_data) {
                return Some(self.quic(ctx));
            }
            return Some(Box::new(RelayLayer::udp(ctx.clone(), false)));
        }

        // Server speaks first.
        if data.data_client().is_empty() {
            let ignore = self.ignored(ctx, None);
            return Some(self.tcp(ctx, ignore));
        }
        match looks_like_tls(data.data_client()) {
            None => None,
            Some(false) => {
                let ignore = self.ignored(ctx, None);
                Some(self.tcp(ctx, ignore))
            }
            Some(true) => match parse_client_hello(data.data_client()) {
                Ok(None) => None,
                Ok(Some(hello)) => {
                    if self.ignored(ctx, hello.sni.as_deref()) {
                        Some(self.tcp(ctx, true))
                    } else {
                        Some(self.tls(ctx))
                    }
                }
                Err(e) => {
                    tracing::debug!("Not a ClientHello ({}), relaying as TCP", e);
                    let ignore = self.ignored(ctx, None);
                    Some(self.tcp(ctx, ignore))
                }
            },
        }
    }
}

fn finish(stack: LayerStack) -> Box<dyn Layer> {
    match stack.build() {
        Some(layer) => layer,
        None => unreachable!("layer stacks always end in a protocol layer"),
    }
}

impl Addon for NextLayerAddon {
    fn name(&self) -> &'static str {
        "next_layer"
    }

    fn handle_hook(&self, hook: &Hook) {
        let Hook::NextLayer(data) = hook else {
            return;
        };
        if data.has_layer() {
            return;
        }
        if let Some(layer) = self.decide(data) {
            tracing::debug!("{} -> {}", data.context().client, layer.name());
            data.set_layer(layer);
        }
    }
}

/// Provides TLS sessions: certificates from the [`CertManager`] towards clients and
/// verified connections towards servers.
pub struct TlsConfigAddon {
    cert_manager: Arc<CertManager>,
    roots: Arc<RootCertStore>,
}

impl TlsConfigAddon {
    pub fn new(cert_manager: Arc<CertManager>) -> Self {
        let roots = RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned());
        Self {
            cert_manager,
            roots: Arc::new(roots),
        }
    }

    /// Also trusts `cert` when verifying servers.
    pub fn trust(mut self, cert: CertificateDer<'static>) -> anyhow::Result<Self> {
        Arc::make_mut(&mut self.roots)
            .add(cert)
            .context("Failed to add trusted certificate")?;
        Ok(self)
    }

    fn tls_clienthello(&self, data: &Shared<ClientHelloData>) {
        let mut data = data.lock();
        let eager = data.context.options.connection_strategy == ConnectionStrategy::Eager;
        data.establish_server_tls_first = eager && data.context.server.lock().tls;
    }

    fn tls_start_client(&self, data: &Shared<TlsData>) {
        let mut data = data.lock();
        if data.session.is_some() {
            return;
        }
        let (host, alpn) = {
            let client = data.conn.lock();
            let server = data.context.server.lock();
            let host = client
                .sni
                .clone()
                .or_else(|| server.address().map(|a| a.host.clone()))
                .unwrap_or_else(|| "localhost".to_string());
            // Mirror what the server picked so both sides agree.
            let alpn = if server.tls_established() {
                match &server.alpn {
                    Some(alpn) if client.alpn_offers.contains(alpn) => vec![alpn.clone()],
                    _ => Vec::new(),
                }
            } else {
                client.alpn_offers.clone()
            };
            (host, alpn)
        };

        let session = self
            .cert_manager
            .server_config_for_host(&host)
            .and_then(|config| {
                let mut config = (*config).clone();
                config.alpn_protocols = alpn;
                Ok(RustlsSession::server(Arc::new(config))?)
            });
        match session {
            Ok(session) => data.session = Some(Box::new(session)),
            Err(e) => tracing::warn!("Cannot create TLS session for {}: {:#}", host, e),
        }
    }

    fn tls_start_server(&self, data: &Shared<TlsData>) {
        let mut data = data.lock();
        if data.session.is_some() {
            return;
        }
        if data.conn == data.context.server {
            let (alpn, offers, sni) = {
                let client = data.context.client.lock();
                (client.alpn.clone(), client.alpn_offers.clone(), client.sni.clone())
            };
            let mut server = data.conn.lock();
            if server.alpn_offers.is_empty() {
                server.alpn_offers = match alpn {
                    Some(alpn) => vec![alpn],
                    None => offers,
                };
            }
            if server.sni.is_none() {
                let host = server.address().map(|a| a.host.clone());
                server.sni = sni.or(host);
            }
        }
        let (name, offers) = {
            let server = data.conn.lock();
            let name = server
                .sni
                .clone()
                .or_else(|| server.address().map(|a| a.host.clone()));
            (name, server.alpn_offers.clone())
        };
        let Some(name) = name else {
            tracing::warn!("Cannot start TLS with {}: no server name", data.conn);
            return;
        };

        let mut config = ClientConfig::builder()
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth();
        config.alpn_protocols = offers;
        match RustlsSession::client(Arc::new(config), &name) {
            Ok(session) => data.session = Some(Box::new(session)),
            Err(e) => tracing::warn!("Cannot create TLS session for {}: {}", name, e),
        }
    }
}

impl Addon for TlsConfigAddon {
    fn name(&self) -> &'static str {
        "tlsconfig"
    }

    fn handle_hook(&self, hook: &Hook) {
        match hook {
            Hook::TlsClientHello(data) => self.tls_clienthello(data),
            Hook::TlsStartClient(data) => self.tls_start_client(data),
            Hook::TlsStartServer(data) => self.tls_start_server(data),
            Hook::TlsFailedClient(data) | Hook::TlsFailedServer(data) => {
                let data = data.lock();
                let conn = data.conn.lock();
                tracing::debug!(
                    "TLS failed with {}: {}",
                    conn,
                    conn.error.as_deref().unwrap_or("unknown error")
                );
            }
            _ => {}
        }
    }
}
