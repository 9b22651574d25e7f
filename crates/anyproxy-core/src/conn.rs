//! Tracked connection wrapper.
//!
//! [`TrackedConn`] wraps one accepted stream. Its lifecycle state and the
//! Unix time of the last transition are packed into a single `AtomicU64`
//! (`unix_secs << 8 | state`) and updated on every read, write and close
//! without taking the tracker lock.
//!
//! A read or write counts once it moves at least one byte; a read that is
//! merely pending leaves the connection `New`.
//!
//! ```text
//! New --(first read/write)--> Active --(any close path)--> Closed
//! ```

use crate::tracker::ConnectionTracker;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Handle of a connection inside its tracker.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    Active = 1,
    Closed = 2,
}

impl ConnState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => ConnState::New,
            1 => ConnState::Active,
            2 => ConnState::Closed,
            other => panic!("internal error: invalid connection state {other}"),
        }
    }
}

fn pack(state: ConnState, unix_secs: u64) -> u64 {
    (unix_secs << 8) | state as u64
}

fn unpack(packed: u64) -> (ConnState, u64) {
    (ConnState::from_bits((packed & 0xff) as u8), packed >> 8)
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// State shared by a [`TrackedConn`] and its tracker entry.
#[derive(Debug)]
pub(crate) struct ConnHandle {
    pub(crate) id: ConnId,
    pub(crate) peer: SocketAddr,
    state: AtomicU64,
    closed: AtomicBool,
    kill: CancellationToken,
}

impl ConnHandle {
    pub(crate) fn new(id: ConnId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: AtomicU64::new(pack(ConnState::New, unix_now())),
            closed: AtomicBool::new(false),
            kill: CancellationToken::new(),
        }
    }

    /// Current state and the Unix time it was entered.
    pub(crate) fn state(&self) -> (ConnState, u64) {
        unpack(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, to: ConnState) {
        let packed = pack(to, unix_now());
        // Closed is terminal
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                match unpack(cur).0 {
                    ConnState::Closed => None,
                    _ => Some(packed),
                }
            });
    }

    fn touch(&self) {
        self.set_state(ConnState::Active);
    }

    /// Run the close path. Returns `true` only for the first caller.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(ConnState::Closed);
        self.kill.cancel();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}

/// An accepted stream registered with a [`ConnectionTracker`].
///
/// Dropping the wrapper closes the stream and deregisters it. The tracker
/// back-reference is weak: the server owns its entries, never the reverse.
#[derive(Debug)]
pub struct TrackedConn<S> {
    inner: S,
    handle: Arc<ConnHandle>,
    tracker: Weak<ConnectionTracker>,
}

impl<S> TrackedConn<S> {
    pub(crate) fn new(inner: S, handle: Arc<ConnHandle>, tracker: Weak<ConnectionTracker>) -> Self {
        Self {
            inner,
            handle,
            tracker,
        }
    }

    pub fn id(&self) -> ConnId {
        self.handle.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer
    }

    pub fn state(&self) -> ConnState {
        self.handle.state().0
    }

    /// Cancelled once the connection is closed by any path.
    pub fn closed_token(&self) -> CancellationToken {
        self.handle.kill_token()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn aborted(&self) -> Option<io::Error> {
        self.handle.is_closed().then(|| {
            io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server")
        })
    }
}

impl<S> Drop for TrackedConn<S> {
    fn drop(&mut self) {
        if self.handle.close() {
            if let Some(tracker) = self.tracker.upgrade() {
                tracker.deregister(self.handle.id);
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.aborted() {
            return Poll::Ready(Err(e));
        }
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.handle.touch();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(e) = this.aborted() {
            return Poll::Ready(Err(e));
        }
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            this.handle.touch();
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
