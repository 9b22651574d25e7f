//! Connection lifecycle controller: accept loop, tracking, shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Server::new(config, engine)
//!       |
//!       v
//! Server::serve(listener) ---- accept --> track (New) --> spawn engine task
//!       |                                                      |
//!       |  Server::shutdown(ctx)                               v
//!       |    close listener, poll tracker with backoff     drop conn
//!       |    force-close New conns past the grace window   (deregister)
//!       |
//!       |  Server::close()
//!       |    close listener, force-close everything
//!       v
//! Err(ServerClosed)
//! ```
//!
//! Shutdown only ever moves forward: once requested, the server never
//! serves again.

use crate::context::Context;
use crate::engine::{ConnContext, ProtocolEngine};
use crate::error::{ProxyError, ProxyResult};
use crate::resolver::{SharedResolver, LOOPBACK_RESOLVER};
use crate::rewrite::{SharedRewriter, LOOPBACK_REDIRECT};
use crate::socks5::Socks5Engine;
use crate::tracker::{ConnectionTracker, TrackerStats};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a connection may stay `New` before shutdown treats it as
/// abandoned.
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(3);

/// Upper bound of the shutdown poll interval.
pub const SHUTDOWN_POLL_INTERVAL_MAX: Duration = Duration::from_millis(500);

const SHUTDOWN_POLL_INTERVAL_BASE: Duration = Duration::from_millis(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Answers domain-name requests.
    pub resolver: SharedResolver,
    /// Picks the upstream for every request.
    pub rewriter: SharedRewriter,
    /// Grace window for connections that never progress past `New`.
    /// Default: 3 seconds
    pub idle_grace: Duration,
    /// Cap of the shutdown poll interval.
    /// Default: 500 ms
    pub poll_interval_max: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            resolver: Arc::new(LOOPBACK_RESOLVER),
            rewriter: Arc::new(LOOPBACK_REDIRECT),
            idle_grace: DEFAULT_IDLE_GRACE,
            poll_interval_max: SHUTDOWN_POLL_INTERVAL_MAX,
        }
    }
}

impl ServerConfig {
    pub fn new(resolver: SharedResolver, rewriter: SharedRewriter) -> Self {
        Self {
            resolver,
            rewriter,
            ..Default::default()
        }
    }
}

pub struct Server {
    config: ServerConfig,
    engine: Arc<dyn ProtocolEngine>,
    tracker: Arc<ConnectionTracker>,
    /// Set once by shutdown or close, never cleared.
    in_shutdown: AtomicBool,
    /// Guards the single listener close.
    listener_close: Once,
    /// Wakes the accept loop so it drops its listener.
    stop_accept: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig, engine: Arc<dyn ProtocolEngine>) -> Self {
        Self {
            config,
            engine,
            tracker: Arc::new(ConnectionTracker::new()),
            in_shutdown: AtomicBool::new(false),
            listener_close: Once::new(),
            stop_accept: CancellationToken::new(),
        }
    }

    /// A server speaking SOCKS5 with the default engine settings.
    pub fn socks5(config: ServerConfig) -> Self {
        Self::new(config, Arc::new(Socks5Engine::default()))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn stats(&self) -> TrackerStats {
        self.tracker.stats()
    }

    /// Accept connections until shutdown or a listener failure.
    ///
    /// Returns [`ProxyError::ServerClosed`] when shutdown was requested and
    /// [`ProxyError::Listener`] when accepting failed otherwise. The
    /// listener is released on every exit path.
    pub async fn serve(&self, listener: TcpListener) -> ProxyResult<()> {
        let result = self.accept_loop(&listener).await;
        drop(listener);
        self.close_listener();
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> ProxyResult<()> {
        if self.is_shutting_down() {
            return Err(ProxyError::ServerClosed);
        }

        let local = listener.local_addr().ok();
        info!(addr = ?local, "ready");
        debug!("accepting requests");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop_accept.cancelled() => return Err(ProxyError::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.serve_conn(stream, peer),
                Err(_) if self.is_shutting_down() => return Err(ProxyError::ServerClosed),
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Err(ProxyError::Listener(e));
                }
            }
        }
    }

    fn serve_conn(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "connection received");

        // registered before the engine sees it
        let conn = self.tracker.track(stream, peer);
        let closed = conn.closed_token();
        let ctx = ConnContext::new(
            conn.id(),
            peer,
            Context::from_token(closed.child_token()),
            self.config.resolver.clone(),
            self.config.rewriter.clone(),
            Arc::downgrade(&self.tracker),
        );
        let engine = self.engine.clone();
        let conn_id = conn.id();

        tokio::spawn(async move {
            tokio::select! {
                result = engine.serve_conn(ctx, conn) => {
                    if let Err(e) = result {
                        warn!(conn_id, error = %e, "connection error");
                    }
                }
                _ = closed.cancelled() => {
                    debug!(conn_id, "connection closed by server");
                }
            }
        });
    }

    fn close_listener(&self) {
        self.listener_close.call_once(|| {
            self.stop_accept.cancel();
            debug!("listener closed");
        });
    }

    /// Stop accepting and wait for tracked connections to finish.
    ///
    /// Connections still `New` after the idle grace window are closed;
    /// `Active` ones are left to end on their own. Returns once nothing is
    /// tracked, or with the context's error ([`ProxyError::ShutdownTimeout`]
    /// or [`ProxyError::Cancelled`]) leaving remaining sessions running.
    pub async fn shutdown(&self, ctx: &Context) -> ProxyResult<()> {
        self.in_shutdown.store(true, Ordering::Release);
        debug!("shutting down");
        self.close_listener();

        let mut backoff = PollBackoff::new(SHUTDOWN_POLL_INTERVAL_BASE, self.config.poll_interval_max);
        loop {
            if self.tracker.sweep_idle(self.config.idle_grace) {
                info!(closed = self.tracker.stats().closed, "shutdown complete");
                return Ok(());
            }

            tokio::select! {
                e = ctx.done() => {
                    warn!(remaining = self.tracker.len(), error = %e, "shutdown interrupted");
                    return Err(e.into());
                }
                _ = tokio::time::sleep(backoff.next_interval()) => {}
            }
        }
    }

    /// Stop accepting and close every tracked connection immediately.
    pub fn close(&self) {
        self.in_shutdown.store(true, Ordering::Release);
        self.close_listener();
        let closed = self.tracker.close_all();
        info!(closed, "server closed");
    }
}

/// Doubling poll interval with up to 10% jitter, capped at `max`.
struct PollBackoff {
    base: Duration,
    max: Duration,
}

impl PollBackoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    fn next_interval(&mut self) -> Duration {
        let jitter_max = (self.base / 10).as_nanos() as u64;
        let jitter = rand::thread_rng().gen_range(0..=jitter_max);
        let interval = self.base + Duration::from_nanos(jitter);
        self.base = (self.base * 2).min(self.max);
        interval
    }
}
