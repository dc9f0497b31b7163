//! Reaching the server through an upstream HTTP proxy with `CONNECT`.

use crate::commands::Command;
use crate::connection::{Connection, ConnectionRef, UpstreamScheme};
use crate::context::Context;
use crate::hooks::{shared, Hook};
use crate::layer::{Commands, Step};
use crate::layers::tls::ServerTls;
use crate::tunnel::{Handshake, LayerStack, Tunnel, TunnelLayer};
use bytes::{Bytes, BytesMut};
use tracing::Level;

const HTTP1_ALPNS: [&[u8]; 3] = [b"http/1.1", b"http/1.0", b"http/0.9"];
const MAX_HEADERS: usize = 64;

/// Payload of the `http_connect_upstream` hook. Addons may add headers, e.g. proxy credentials.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub authority: String,
    pub headers: Vec<(String, String)>,
    pub proxy: ConnectionRef,
}

impl ConnectRequest {
    fn assemble(&self) -> Vec<u8> {
        let mut raw = format!("CONNECT {} HTTP/1.1\r\n", self.authority);
        for (name, value) in &self.headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        raw.push_str("\r\n");
        raw.into_bytes()
    }
}

/// Tunnels the server connection through the proxy in the server's `via`.
///
/// Without `send_connect` the tunnel is transparent, which is how a TLS-wrapped proxy is
/// spoken to once the outer TLS layer has done its job.
pub struct HttpUpstreamProxy {
    buf: BytesMut,
    send_connect: bool,
}

impl HttpUpstreamProxy {
    pub const NAME: &'static str = "HttpUpstreamProxy";

    /// Builds the layers needed to reach `ctx.server` through its upstream proxy: TLS towards
    /// the proxy for `https` proxies, then the CONNECT tunnel. `None` if no proxy is configured.
    pub fn make(ctx: &Context, send_connect: bool) -> Option<LayerStack> {
        let via = ctx.server.lock().via().cloned()?;
        let mut proxy = Connection::server(Some(via.address.clone()));
        let mut stack = LayerStack::new();
        let tls = via.scheme == UpstreamScheme::Https;
        if tls {
            proxy.alpn_offers = HTTP1_ALPNS.iter().map(|alpn| alpn.to_vec()).collect();
            proxy.sni = Some(via.address.host.clone());
        }
        let proxy = ConnectionRef::new(proxy);
        if tls {
            stack.push(Box::new(ServerTls::layer(ctx.clone(), Some(proxy.clone()))));
        }
        let server = ctx.server.clone();
        stack.push(Box::new(TunnelLayer::new(
            ctx.clone(),
            proxy,
            server,
            Self {
                buf: BytesMut::new(),
                send_connect,
            },
        )));
        Some(stack)
    }
}

fn proxy_address(t: &TunnelLayer<HttpUpstreamProxy>) -> String {
    match t.tunnel_connection.lock().address() {
        Some(address) => address.to_string(),
        None => "<no address>".to_string(),
    }
}

impl Tunnel for HttpUpstreamProxy {
    const NAME: &'static str = HttpUpstreamProxy::NAME;

    fn start_handshake(t: &mut TunnelLayer<Self>, out: &mut Commands) -> Step<TunnelLayer<Self>> {
        if !t.proto.send_connect {
            let event = crate::events::Event::data(&t.tunnel_connection, Bytes::new());
            return t.handle_tunnel_event(event, out);
        }
        let address = t.conn.lock().address().cloned();
        let Some(address) = address else {
            return Self::on_handshake_error(t, "server has no address".to_string(), out);
        };
        let authority = address.to_string();
        let mut headers = Vec::new();
        if t.context.options.http_connect_send_host_header {
            headers.push(("Host".to_string(), authority.clone()));
        }
        let request = shared(ConnectRequest {
            authority,
            headers,
            proxy: t.tunnel_connection.clone(),
        });
        Step::emit(Command::hook(Hook::HttpConnectUpstream(request.clone())), out).then(
            t,
            out,
            move |this: &mut TunnelLayer<Self>, out, _| {
                let raw = request.lock().assemble();
                out.push(Command::send_data(&this.tunnel_connection, raw));
                Step::done()
            },
        )
    }

    fn receive_handshake_data(
        t: &mut TunnelLayer<Self>,
        data: Bytes,
        out: &mut Commands,
    ) -> Step<TunnelLayer<Self>, Handshake> {
        if !t.proto.send_connect {
            return Step::Ready((true, None));
        }
        t.proto.buf.extend_from_slice(&data);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let parsed = response.parse(&t.proto.buf);
        let (head_len, code, reason) = match parsed {
            Ok(httparse::Status::Partial) => return Step::Ready((false, None)),
            Ok(httparse::Status::Complete(len)) => (
                len,
                response.code.unwrap_or_default(),
                response.reason.unwrap_or_default().to_string(),
            ),
            Err(e) => {
                let proxy = proxy_address(t);
                out.push(Command::log(format!("{}: {}", proxy, e), Level::INFO));
                return Step::Ready((false, Some(format!("Error connecting to {}: {}", proxy, e))));
            }
        };

        let head = t.proto.buf.split_to(head_len);
        if !(200..300).contains(&code) {
            let proxy = proxy_address(t);
            out.push(Command::log(
                format!("{}: {}", proxy, String::from_utf8_lossy(&head).trim_end()),
                Level::DEBUG,
            ));
            return Step::Ready((
                false,
                Some(format!(
                    "Upstream proxy {} refused HTTP CONNECT request: {} {}",
                    proxy, code, reason
                )),
            ));
        }
        let rest = t.proto.buf.split().freeze();
        let step = if rest.is_empty() {
            Step::done()
        } else {
            Self::receive_data(t, rest, out)
        };
        step.map(|()| (true, None))
    }
}
