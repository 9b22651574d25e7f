use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by the anyproxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The accept loop stopped because shutdown was requested. Expected.
    #[error("socks: server closed")]
    ServerClosed,

    /// Accepting from the listener failed outside of shutdown. Fatal for
    /// the accept loop.
    #[error("listener failure: {0}")]
    Listener(#[source] std::io::Error),

    /// The shutdown deadline expired before every tracked connection closed.
    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Address or rewrite configuration rejected before serving.
    #[error("invalid rewrite configuration: {0}")]
    RewriteConfig(String),

    /// The client violated the SOCKS5 protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Dialing the rewritten upstream failed.
    #[error("upstream connect to {addr} failed: {source}")]
    Upstream {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// I/O on the client connection failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for the expected terminal signal of [`crate::Server::serve`].
    pub fn is_server_closed(&self) -> bool {
        matches!(self, ProxyError::ServerClosed)
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_closed_is_distinguishable() {
        assert!(ProxyError::ServerClosed.is_server_closed());
        assert!(!ProxyError::ShutdownTimeout.is_server_closed());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(!ProxyError::Listener(io).is_server_closed());
    }

    #[test]
    fn test_upstream_display_names_address() {
        let err = ProxyError::Upstream {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: ProxyError = io.into();
        assert!(matches!(err, ProxyError::Io(_)));
        assert_eq!(err.to_string(), "io error: pipe");
    }
}
