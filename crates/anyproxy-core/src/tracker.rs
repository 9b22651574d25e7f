//! Registry of in-flight connections.
//!
//! One mutex guards the membership map for every mutation and iteration.
//! Per-connection state lives outside the lock (see [`crate::conn`]).

use crate::conn::{unix_now, ConnHandle, ConnId, ConnState, TrackedConn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Counters reported by [`ConnectionTracker::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Connections currently registered.
    pub live: usize,
    /// Connections ever registered.
    pub accepted: u64,
    /// Connections whose close path has run.
    pub closed: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    conns: Mutex<HashMap<ConnId, Arc<ConnHandle>>>,
    next_id: AtomicU64,
    accepted: AtomicU64,
    closed: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn conns(&self) -> MutexGuard<'_, HashMap<ConnId, Arc<ConnHandle>>> {
        // a panic while holding the lock leaves the map consistent
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wrap `stream` and register it in state [`ConnState::New`].
    pub fn track<S>(self: &Arc<Self>, stream: S, peer: SocketAddr) -> TrackedConn<S> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(ConnHandle::new(id, peer));
        self.conns().insert(id, handle.clone());
        self.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = id, peer = %peer, "connection tracked");
        TrackedConn::new(stream, handle, Arc::downgrade(self))
    }

    /// Called from the wrapper's close path after it has run.
    pub(crate) fn deregister(&self, id: ConnId) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        if self.conns().remove(&id).is_some() {
            debug!(conn_id = id, "connection untracked");
        }
    }

    /// Lookup used by the protocol engine through its connection context.
    pub fn state_of(&self, id: ConnId) -> Option<ConnState> {
        self.conns().get(&id).map(|h| h.state().0)
    }

    /// Force-close connections still `New` after `grace`; `Active` ones are
    /// left to finish. Returns `true` once nothing is tracked.
    pub fn sweep_idle(&self, grace: Duration) -> bool {
        let cutoff = unix_now().saturating_sub(grace.as_secs());
        let mut conns = self.conns();
        let mut quiescent = true;

        conns.retain(|id, handle| {
            let (state, since) = handle.state();
            match state {
                ConnState::Closed => false,
                ConnState::New if since < cutoff => {
                    if handle.close() {
                        self.closed.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(conn_id = *id, peer = %handle.peer, "closed idle connection");
                    false
                }
                _ => {
                    quiescent = false;
                    true
                }
            }
        });

        quiescent
    }

    /// Close and deregister everything. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.conns().drain().map(|(_, h)| h).collect();
        let mut count = 0;
        for handle in drained {
            if handle.close() {
                self.closed.fetch_add(1, Ordering::Relaxed);
                count += 1;
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.conns().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns().is_empty()
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            live: self.len(),
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}
