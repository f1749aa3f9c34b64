//! # Connection Registry
//!
//! Purpose: Account for every live socket opened by a client so that
//! closing a logical connection can be verified to release everything it
//! opened (data nodes, sentinel command and pub/sub sockets).
//!
//! ## Design Principles
//! 1. **Single Lock**: One mutex guards the set; size queries never tear.
//! 2. **Explicit Introspection**: `len`, `count_of` and `snapshot` are the
//!    supported way to look inside, for tests and diagnostics alike.
//! 3. **Idempotent Release**: Deregistering twice is harmless.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Identifier of one registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Purpose of a registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Data connection to a master or replica.
    Data,
    /// Short-lived sentinel connection used for discovery.
    SentinelCommand,
    /// Long-lived sentinel connection receiving failover events.
    SentinelPubSub,
}

/// Entry describing a live socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredConnection {
    pub id: ConnectionId,
    pub addr: String,
    pub kind: ConnectionKind,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    live: Mutex<BTreeMap<ConnectionId, RegisteredConnection>>,
}

/// Shared registry handle; clones observe the same set.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Records a newly opened socket and returns its identifier.
    pub fn register(&self, addr: &str, kind: ConnectionKind) -> ConnectionId {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut live = self.inner.live.lock();
        live.insert(
            id,
            RegisteredConnection {
                id,
                addr: addr.to_string(),
                kind,
            },
        );
        debug!(%id, addr, ?kind, live = live.len(), "connection registered");
        id
    }

    /// Removes a socket. Returns false when it was not registered.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let mut live = self.inner.live.lock();
        let removed = live.remove(&id).is_some();
        if removed {
            debug!(%id, live = live.len(), "connection deregistered");
        }
        removed
    }

    /// Number of live sockets.
    pub fn len(&self) -> usize {
        self.inner.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live sockets of one kind.
    pub fn count_of(&self, kind: ConnectionKind) -> usize {
        self.inner.live.lock().values().filter(|entry| entry.kind == kind).count()
    }

    /// Point-in-time copy of all entries, ordered by registration.
    pub fn snapshot(&self) -> Vec<RegisteredConnection> {
        self.inner.live.lock().values().cloned().collect()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry").field("live", &self.len()).finish()
    }
}
