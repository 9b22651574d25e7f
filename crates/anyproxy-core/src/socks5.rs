//! Minimal SOCKS5 server engine (RFC 1928), CONNECT only, no authentication.
//!
//! Domain-name requests go through the configured [`crate::NameResolver`];
//! every request then goes through the [`crate::AddressRewriter`] before
//! the upstream dial.

use crate::addr::{AddressSpec, Request};
use crate::conn::TrackedConn;
use crate::engine::{ConnContext, EngineFuture, ProtocolEngine};
use crate::error::{ProxyError, ProxyResult};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

const VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Default timeout for dialing the rewritten upstream.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reply codes sent in the server's response to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddrTypeNotSupported = 0x08,
}

impl Reply {
    fn for_connect_error(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::TimedOut | io::ErrorKind::HostUnreachable => Reply::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Destination as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

#[derive(Debug, Clone)]
pub struct Socks5Engine {
    connect_timeout: Duration,
}

impl Default for Socks5Engine {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Socks5Engine {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn serve(&self, ctx: ConnContext, mut conn: TrackedConn<TcpStream>) -> ProxyResult<()> {
        negotiate_method(&mut conn).await?;

        let (cmd, target) = match read_request(&mut conn).await {
            Ok(req) => req,
            Err(RequestError::AddrType(atyp)) => {
                write_reply(&mut conn, Reply::AddrTypeNotSupported, None).await?;
                return Err(ProxyError::Protocol(format!("unsupported address type {atyp:#04x}")));
            }
            Err(RequestError::Other(e)) => return Err(e),
        };

        if cmd != CMD_CONNECT {
            write_reply(&mut conn, Reply::CommandNotSupported, None).await?;
            return Err(ProxyError::Protocol(format!("unsupported command {cmd:#04x}")));
        }

        let request = match target {
            TargetAddr::Ip(addr) => Request::new(addr.into()),
            TargetAddr::Domain(name, port) => match ctx.resolve(&name) {
                Ok(ip) => Request::new(AddressSpec::new(ip, port)).with_fqdn(name),
                Err(e) => {
                    write_reply(&mut conn, Reply::HostUnreachable, None).await?;
                    return Err(e.into());
                }
            },
        }
        .with_client(ctx.peer());

        let dest = ctx.rewrite(&request);
        info!(
            conn_id = ctx.id(),
            requested = %request.dest,
            fqdn = request.fqdn.as_deref().unwrap_or(""),
            upstream = %dest,
            "connecting"
        );

        let addr = dest.socket_addr();
        let dialed = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")));
        let mut upstream = match dialed {
            Ok(stream) => stream,
            Err(source) => {
                write_reply(&mut conn, Reply::for_connect_error(&source), None).await?;
                return Err(ProxyError::Upstream { addr, source });
            }
        };

        let bound = upstream.local_addr()?;
        write_reply(&mut conn, Reply::Succeeded, Some(bound)).await?;

        let (sent, received) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
        debug!(conn_id = ctx.id(), sent, received, "session finished");
        Ok(())
    }
}

impl ProtocolEngine for Socks5Engine {
    fn serve_conn<'a>(&'a self, ctx: ConnContext, conn: TrackedConn<TcpStream>) -> EngineFuture<'a> {
        Box::pin(self.serve(ctx, conn))
    }
}

async fn negotiate_method<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> ProxyResult<()> {
    let version = stream.read_u8().await?;
    if version != VERSION {
        return Err(ProxyError::Protocol(format!("unsupported version {version}")));
    }

    let count = stream.read_u8().await?;
    let mut methods = vec![0u8; count as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(ProxyError::Protocol("no acceptable authentication method".into()));
    }

    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

enum RequestError {
    AddrType(u8),
    Other(ProxyError),
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Other(e.into())
    }
}

async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u8, TargetAddr), RequestError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _rsv, atyp] = header;
    if version != VERSION {
        return Err(RequestError::Other(ProxyError::Protocol(format!(
            "unsupported version {version}"
        ))));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let name = String::from_utf8(name).map_err(|_| {
                RequestError::Other(ProxyError::Protocol("domain is not utf-8".into()))
            })?;
            TargetAddr::Domain(name, port)
        }
        other => return Err(RequestError::AddrType(other)),
    };

    Ok((cmd, target))
}

fn encode_reply(reply: Reply, bound: Option<SocketAddr>) -> Vec<u8> {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[VERSION, reply as u8, 0x00]);
    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&bound.port().to_be_bytes());
    buf
}

async fn write_reply<S: AsyncWrite + Unpin>(
    stream: &mut S,
    reply: Reply,
    bound: Option<SocketAddr>,
) -> io::Result<()> {
    stream.write_all(&encode_reply(reply, bound)).await?;
    stream.flush().await
}
