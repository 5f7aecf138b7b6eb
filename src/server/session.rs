//! Connection records and the connection table.
//!
//! A [`Session`] is the shared half of a connection: its handler task drives
//! it, while the table and the owner only ever read snapshots. Every state
//! change is a single check-and-set under the state lock, so concurrent
//! closers cannot both win.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::stats::{ConnectionId, ConnectionState, ConnectionStats, Destination};

/// Shared record of one proxied connection.
pub struct Session {
    id: ConnectionId,
    peer_addr: SocketAddr,
    started_at: DateTime<Utc>,
    state: Mutex<ConnectionState>,
    destination: Mutex<Option<Destination>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    cancel: CancellationToken,
}

impl Session {
    fn new(id: ConnectionId, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer_addr,
            started_at: Utc::now(),
            state: Mutex::new(ConnectionState::AwaitingGreeting),
            destination: Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            cancel,
        }
    }

    /// Get connection ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the client's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Returns `false`, changing nothing, for backward or skipping moves and
    /// for any move out of `Closed`.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        true
    }

    /// Enter `Closed`. Only the first caller gets `true`.
    pub fn close(&self) -> bool {
        self.advance(ConnectionState::Closed)
    }

    /// Record the parsed destination.
    pub fn set_destination(&self, destination: Destination) {
        *self.destination.lock() = Some(destination);
    }

    /// Count bytes relayed client → target.
    pub fn add_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count bytes relayed target → client.
    pub fn add_bytes_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Signal the handler to tear down.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the handler at every suspension point.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Take a snapshot.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            peer_addr: self.peer_addr,
            destination: self.destination.lock().clone(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            state: self.state(),
            started_at: self.started_at,
        }
    }
}

/// Live connections keyed by id.
pub struct ConnectionTable {
    sessions: RwLock<HashMap<ConnectionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id and insert a fresh session for `peer_addr`.
    pub fn register(&self, peer_addr: SocketAddr, cancel: CancellationToken) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, peer_addr, cancel));
        self.sessions.write().insert(id, Arc::clone(&session));
        session
    }

    /// Get a session by ID.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Remove a session.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    /// Get live connection count.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Signal every live session to tear down.
    pub fn cancel_all(&self) {
        for session in self.sessions.read().values() {
            session.cancel();
        }
    }

    /// Drop every entry, returning how many were left.
    pub fn clear(&self) -> usize {
        let mut sessions = self.sessions.write();
        let left = sessions.len();
        sessions.clear();
        left
    }

    /// Snapshots of all live connections, ordered by id.
    pub fn all_stats(&self) -> Vec<ConnectionStats> {
        let mut stats: Vec<_> = self.sessions.read().values().map(|s| s.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.168.1.50:50123".parse().unwrap()
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let table = ConnectionTable::new();
        let a = table.register(peer(), CancellationToken::new());
        let b = table.register(peer(), CancellationToken::new());

        assert_ne!(a.id(), b.id());
        assert_eq!(table.count(), 2);
        assert_eq!(a.state(), ConnectionState::AwaitingGreeting);
    }

    #[test]
    fn test_remove_and_clear() {
        let table = ConnectionTable::new();
        let a = table.register(peer(), CancellationToken::new());
        table.register(peer(), CancellationToken::new());

        assert!(table.remove(a.id()).is_some());
        assert!(table.remove(a.id()).is_none());
        assert!(table.get(a.id()).is_none());
        assert_eq!(table.clear(), 1);
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_close_exactly_once() {
        let table = ConnectionTable::new();
        let session = table.register(peer(), CancellationToken::new());

        assert!(session.advance(ConnectionState::AwaitingRequest));
        assert!(!session.advance(ConnectionState::Relaying));
        assert!(session.close());
        assert!(!session.close());
        assert!(!session.advance(ConnectionState::Connecting));
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_concurrent_close() {
        let table = ConnectionTable::new();
        let session = table.register(peer(), CancellationToken::new());

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8).map(|_| scope.spawn(|| session.close())).collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_cancel_all() {
        let table = ConnectionTable::new();
        let parent = CancellationToken::new();
        let a = table.register(peer(), parent.child_token());
        let b = table.register(peer(), parent.child_token());

        table.cancel_all();
        assert!(a.cancellation().is_cancelled());
        assert!(b.cancellation().is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_session_stats() {
        let table = ConnectionTable::new();
        let session = table.register(peer(), CancellationToken::new());
        session.set_destination(Destination {
            host: "example.com".into(),
            port: 443,
        });
        session.add_bytes_in(100);
        session.add_bytes_out(2000);

        let stats = session.stats();
        assert_eq!(stats.id, session.id());
        assert_eq!(stats.peer_addr, peer());
        assert_eq!(stats.destination.unwrap().host, "example.com");
        assert_eq!(stats.bytes_in, 100);
        assert_eq!(stats.bytes_out, 2000);
        assert_eq!(table.all_stats().len(), 1);
    }
}
