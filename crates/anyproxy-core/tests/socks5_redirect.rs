//! End-to-end: a SOCKS5 client asks for arbitrary destinations and lands on
//! a local upstream chosen by the rewrite chain.

use anyproxy_core::{
    chain, Context, FixedResolver, HostTranslate, PortMap, ProxyError, Server, ServerConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Upstream that echoes everything back.
async fn echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn start_proxy(upstream_port: u16) -> (Arc<Server>, SocketAddr) {
    let localhost = "127.0.0.1".parse().unwrap();
    let config = ServerConfig::new(
        Arc::new(FixedResolver::new(localhost)),
        chain(vec![
            Arc::new(PortMap::parse("80", &upstream_port.to_string()).unwrap()),
            Arc::new(HostTranslate::new(localhost)),
        ]),
    );
    let server = Arc::new(Server::socks5(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = server.clone();
    tokio::spawn(async move { srv.serve(listener).await });
    (server, addr)
}

async fn greet(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x00]);
    stream
}

/// Send a CONNECT and return the reply code.
async fn connect(stream: &mut TcpStream, atyp_and_addr: &[u8], port: u16) -> u8 {
    let mut msg = vec![0x05, 0x01, 0x00];
    msg.extend_from_slice(atyp_and_addr);
    msg.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&msg).await.unwrap();

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        other => panic!("unexpected bound address type {other}"),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await.unwrap();
    head[1]
}

async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_ip_request_is_redirected() {
    let upstream = echo_upstream().await;
    let (_server, proxy) = start_proxy(upstream.port()).await;

    let mut stream = greet(proxy).await;
    let reply = connect(&mut stream, &[0x01, 93, 184, 216, 34], 80).await;
    assert_eq!(reply, 0x00);
    roundtrip(&mut stream, b"GET / HTTP/1.1\r\n\r\n").await;
}

#[tokio::test]
async fn test_domain_request_uses_fixed_resolver() {
    let upstream = echo_upstream().await;
    let (_server, proxy) = start_proxy(upstream.port()).await;

    let mut stream = greet(proxy).await;
    let mut addr = vec![0x03, 11];
    addr.extend_from_slice(b"example.com");
    let reply = connect(&mut stream, &addr, 80).await;
    assert_eq!(reply, 0x00);
    roundtrip(&mut stream, b"hello through the proxy").await;
}

#[tokio::test]
async fn test_unmapped_port_keeps_port_and_fails_upstream() {
    // the upstream only listens on its own port; port 1 is refused
    let upstream = echo_upstream().await;
    let (_server, proxy) = start_proxy(upstream.port()).await;

    let mut stream = greet(proxy).await;
    let reply = connect(&mut stream, &[0x01, 1, 2, 3, 4], 1).await;
    assert_eq!(reply, 0x05);
}

#[tokio::test]
async fn test_bind_command_not_supported() {
    let upstream = echo_upstream().await;
    let (_server, proxy) = start_proxy(upstream.port()).await;

    let mut stream = greet(proxy).await;
    stream
        .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);
}

#[tokio::test]
async fn test_shutdown_drains_after_client_leaves() {
    let upstream = echo_upstream().await;
    let (server, proxy) = start_proxy(upstream.port()).await;

    let mut stream = greet(proxy).await;
    assert_eq!(connect(&mut stream, &[0x01, 10, 0, 0, 1], 80).await, 0x00);
    roundtrip(&mut stream, b"ping").await;

    // an active session holds shutdown open
    let short = Context::background().with_timeout(Duration::from_millis(200));
    assert!(matches!(server.shutdown(&short).await, Err(ProxyError::ShutdownTimeout)));

    drop(stream);
    let ctx = Context::background().with_timeout(Duration::from_secs(5));
    server.shutdown(&ctx).await.unwrap();
    assert!(server.tracker().is_empty());
    assert_eq!(server.stats().closed, server.stats().accepted);
}
