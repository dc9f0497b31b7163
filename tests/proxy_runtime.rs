use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use layerproxy::connection::Address;
use layerproxy::layers::dns::{types, DnsMessage, Question, ResourceRecord};
use layerproxy::options::{ProxyMode, ReverseScheme};
use layerproxy::proxy::{ProxyConfig, ProxyServer};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

async fn start_proxy(mode: ProxyMode, udp: bool, storage: &std::path::Path) -> (SocketAddr, Arc<layerproxy::proxy::cert_manager::CertManager>) {
    let mut config = ProxyConfig {
        port: 0,
        udp,
        storage_path: storage.to_path_buf(),
        ..ProxyConfig::default()
    };
    config.options.mode = mode;
    let server = ProxyServer::bind(config).await.expect("proxy binds");
    let addr = server.local_addr().unwrap();
    let cert_manager = server.cert_manager().clone();
    tokio::spawn(server.serve(std::future::pending()));
    (addr, cert_manager)
}

fn reverse(scheme: ReverseScheme, target: SocketAddr) -> ProxyMode {
    ProxyMode::Reverse {
        scheme,
        address: Address::from(target),
        via: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reverse_tcp_relays_and_propagates_half_close() {
    let storage = tempfile::tempdir().unwrap();
    let upstream = echo_server().await;
    let (proxy, _) = start_proxy(reverse(ReverseScheme::Tcp, upstream), false, storage.path()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"hello through the proxy").await.unwrap();
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .expect("proxy closes the client after the server")
        .unwrap();
    assert_eq!(received, b"hello through the proxy");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_tls_is_terminated_with_a_certificate_from_the_local_ca() {
    let storage = tempfile::tempdir().unwrap();
    let upstream = echo_server().await;
    let (proxy, cert_manager) =
        start_proxy(reverse(ReverseScheme::Tcp, upstream), false, storage.path()).await;

    let mut roots = RootCertStore::empty();
    roots.add(cert_manager.ca_der()).unwrap();
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let echoed = tokio::task::spawn_blocking(move || {
        let mut sock = std::net::TcpStream::connect(proxy).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let name = "localhost".try_into().unwrap();
        let mut conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
        let mut tls = rustls::Stream::new(&mut conn, &mut sock);
        tls.write_all(b"hello tls").unwrap();
        let mut buf = [0u8; 9];
        tls.read_exact(&mut buf).unwrap();
        buf
    })
    .await
    .unwrap();
    assert_eq!(&echoed, b"hello tls");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dns_queries_over_udp_are_answered_by_the_upstream_resolver() {
    let storage = tempfile::tempdir().unwrap();
    let resolver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let resolver_addr = resolver.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, peer)) = resolver.recv_from(&mut buf).await {
            let query = DnsMessage::unpack(&buf[..n]).unwrap();
            let name = query.questions[0].name.clone();
            let answer = query.succeed(vec![ResourceRecord::a(name, Ipv4Addr::new(10, 0, 0, 7))]);
            resolver.send_to(&answer.packed().unwrap(), peer).await.unwrap();
        }
    });

    let (proxy, _) = start_proxy(reverse(ReverseScheme::Dns, resolver_addr), true, storage.path()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = DnsMessage::query(0x4242, Question::new("example.com", types::A));
    client.send_to(&query.packed().unwrap(), proxy).await.unwrap();

    let mut buf = [0u8; 512];
    let n = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .expect("answer arrives")
        .unwrap();
    let response = DnsMessage::unpack(&buf[..n]).unwrap();
    assert_eq!(response.id, 0x4242);
    assert!(!response.query);
    assert_eq!(response.answers[0].ipv4_address(), Some(Ipv4Addr::new(10, 0, 0, 7)));
}
