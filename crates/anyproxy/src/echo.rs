//! Built-in HTTP and HTTPS responders that answer every request with
//! `200 OK` / `OK!`. The default redirect chain points ports 80 and 443
//! at these.

use anyproxy_core::{Context, ProxyResult};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Bound on the TLS handshake and on reading each request head.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

const BODY: &[u8] = b"OK!";

/// Plain or TLS echo responder.
pub struct EchoServer {
    scheme: &'static str,
    tls: Option<TlsAcceptor>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

impl EchoServer {
    pub fn http() -> Self {
        Self::with_tls("http", None)
    }

    pub fn https(acceptor: TlsAcceptor) -> Self {
        Self::with_tls("https", Some(acceptor))
    }

    fn with_tls(scheme: &'static str, tls: Option<TlsAcceptor>) -> Self {
        Self {
            scheme,
            tls,
            stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Accept and answer requests until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(scheme = self.scheme, addr = ?listener.local_addr().ok(), "echo responder listening");
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };

            let tls = self.tls.clone();
            let scheme = self.scheme;
            let stop = self.stop.clone();
            self.tasks.spawn(async move {
                let result = match tls {
                    Some(acceptor) => match tokio::time::timeout(READ_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => serve_http(tls_stream, peer, scheme, stop).await,
                        Ok(Err(e)) => Err(e.into()),
                        Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into()),
                    },
                    None => serve_http(stream, peer, scheme, stop).await,
                };
                if let Err(e) = result {
                    debug!(scheme, %peer, error = %e, "echo connection ended");
                }
            });
        }
    }

    /// Stop accepting and wait for in-flight requests, bounded by `ctx`.
    pub async fn shutdown(&self, ctx: &Context) -> ProxyResult<()> {
        self.stop.cancel();
        self.tasks.close();
        tokio::select! {
            _ = self.tasks.wait() => Ok(()),
            e = ctx.done() => {
                warn!(scheme = self.scheme, pending = self.tasks.len(), "echo responder shutdown interrupted");
                Err(e.into())
            }
        }
    }
}

/// Serve HTTP/1.1 (with keep-alive) on one connection until the peer
/// leaves or `stop` fires; a request in flight is finished first.
async fn serve_http<S>(stream: S, peer: SocketAddr, scheme: &'static str, stop: CancellationToken) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| async move {
        info!(scheme, %peer, method = %req.method(), uri = %req.uri(), "echo request");
        Ok::<_, Infallible>(ok_response())
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let stopped = tokio::select! {
        res = conn.as_mut() => {
            res?;
            false
        }
        _ = stop.cancelled() => true,
    };
    if stopped {
        conn.as_mut().graceful_shutdown();
        conn.await?;
    }
    Ok(())
}

fn ok_response() -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(BODY)));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}

/// Generate a self-signed certificate covering `hosts`.
pub fn self_signed_cert(hosts: &[String]) -> anyhow::Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::new(hosts.to_vec())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "anyproxy");
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert.der().clone(), key))
}

pub fn tls_acceptor(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> anyhow::Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn spawn(server: Arc<EchoServer>) -> (SocketAddr, tokio::task::JoinHandle<std::io::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move { server.serve(listener).await });
        (addr, handle)
    }

    /// Send one GET and read until the body arrives.
    async fn get<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, connection: &str) -> String {
        let req = format!("GET /health HTTP/1.1\r\nHost: example.com\r\nConnection: {connection}\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();

        let mut out = Vec::new();
        let mut chunk = [0u8; 1024];
        while !out.ends_with(b"\r\n\r\nOK!") {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the body");
            out.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_http_echo() {
        let server = Arc::new(EchoServer::http());
        let (addr, handle) = spawn(server.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let response = get(&mut stream, "close").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.to_ascii_lowercase().contains("content-length: 3"));

        server.shutdown(&Context::background()).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_serves_several_requests() {
        let server = Arc::new(EchoServer::http());
        let (addr, _handle) = spawn(server.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..3 {
            let response = get(&mut stream, "keep-alive").await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        }

        // an idle keep-alive connection does not hold up shutdown
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        server.shutdown(&ctx).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_https_echo() {
        let (cert, key) = self_signed_cert(&["127.0.0.1".to_string()]).unwrap();
        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert.clone()).unwrap();

        let server = Arc::new(EchoServer::https(tls_acceptor(cert, key).unwrap()));
        let (addr, _handle) = spawn(server.clone()).await;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut tls = connector
            .connect(ServerName::try_from("127.0.0.1").unwrap(), tcp)
            .await
            .unwrap();

        let response = get(&mut tls, "close").await;
        assert!(response.ends_with("OK!"));
        server.shutdown(&Context::background()).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cuts_idle_request() {
        let server = Arc::new(EchoServer::http());
        let (addr, _handle) = spawn(server.clone()).await;

        // Connected but never sends a request head.
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        server.shutdown(&ctx).await.unwrap();
    }
}
