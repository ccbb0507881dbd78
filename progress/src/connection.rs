use crate::error::{capacity_error, protocol_error, Error, ProtocolErrorKind};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::*;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time;

pub use events::UserId;

/// Longest a single frame write may take before the peer is treated as stalled.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write half of a connection, type-erased so tests can substitute in-memory streams.
pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One live, authenticated connection.
///
/// Writes are serialized by an internal lock so the owning handler (handshake)
/// and the dispatch worker (fan-out) never interleave bytes on the stream.
/// A write gives up as soon as the handle is closed or the write timeout
/// elapses, so a peer that stops reading never pins the lock.
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    established_at: DateTime<Utc>,
    write_timeout: Duration,
    writer: Mutex<FrameWriter>,
    closed: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn new<W>(user_id: impl Into<UserId>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_write_timeout(user_id, writer, DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_write_timeout<W>(
        user_id: impl Into<UserId>,
        writer: W,
        write_timeout: Duration,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: ConnectionId::new(),
            user_id: user_id.into(),
            established_at: Utc::now(),
            write_timeout,
            writer: Mutex::new(Box::new(writer)),
            closed,
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver that observes `true` once [`ConnectionHandle::close`] has run.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Exclusive access to the write half, for handshake frames that must not
    /// be preceded by a broadcast.
    pub async fn lock_writer(&self) -> MutexGuard<'_, FrameWriter> {
        self.writer.lock().await
    }

    /// Writes one already-encoded frame.
    ///
    /// Fails with `NotConnected` if the handle is closed before or during the
    /// write. A write that outlasts the write timeout fails with `TimedOut`
    /// and closes the handle, since the peer may now hold a partial frame.
    pub async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }

        let outcome = tokio::select! {
            result = time::timeout(self.write_timeout, self.write_locked(frame)) => result,
            _ = async { closed.wait_for(|closed| *closed).await.map(|_| ()) } => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection closed during write",
                ));
            }
        };

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Write to connection {} for user {} stalled for {:?}; closing it",
                    self.id, self.user_id, self.write_timeout
                );
                self.close().await;
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer stopped reading",
                ))
            }
        }
    }

    async fn write_locked(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    /// Marks the handle closed, wakes the owning handler and shuts down the
    /// write half. Idempotent.
    ///
    /// Never waits on a stalled peer: a fan-out write in progress abandons
    /// the lock once the flag flips, and the shutdown itself is bounded by
    /// the write timeout. If the lock stays busy the stream is shut when the
    /// last reference to the handle drops.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let mut writer = match time::timeout(self.write_timeout, self.writer.lock()).await {
            Ok(writer) => writer,
            Err(_) => {
                debug!(
                    "Writer of connection {} for user {} still busy; skipping shutdown",
                    self.id, self.user_id
                );
                return;
            }
        };
        match time::timeout(self.write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(
                "Shutdown of connection {} for user {} reported: {e}",
                self.id, self.user_id
            ),
            Err(_) => debug!(
                "Shutdown of connection {} for user {} timed out",
                self.id, self.user_id
            ),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("established_at", &self.established_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Registry of live connections with dual indices and a global capacity limit.
///
/// Lock discipline: no method ever holds a guard on both maps at once, and no
/// guard is held across an `.await`.
pub struct SessionRegistry {
    max_connections: usize,

    /// Live connection count. Slots are reserved with a compare-and-swap
    /// before insertion so concurrent registrations cannot overshoot.
    live: AtomicUsize,

    /// Primary storage: lookup by connection_id for registration/cleanup
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,

    /// Secondary index: lookup by user_id for message routing
    user_index: DashMap<UserId, HashSet<ConnectionId>>,
}

impl SessionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            live: AtomicUsize::new(0),
            connections: DashMap::new(),
            user_index: DashMap::new(),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Total live connections across all users.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of users with at least one live connection.
    pub fn user_count(&self) -> usize {
        self.user_index.len()
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.user_index.get(user_id).map_or(0, |set| set.len())
    }

    /// Registers a handle under its user. Visible to `snapshot` as soon as this returns.
    ///
    /// Fails without mutating anything when the registry is full or the
    /// handle has no user identity. Registering the same handle twice is a no-op.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<(), Error> {
        if handle.user_id().is_empty() {
            return Err(protocol_error(
                ProtocolErrorKind::MissingUserId,
                "cannot register a connection without a user_id",
            ));
        }

        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_connections).then_some(live + 1)
            })
            .map_err(|_| capacity_error(self.max_connections))?;

        let connection_id = handle.id().clone();
        let user_id = handle.user_id().to_string();

        // Indexed by user before it becomes visible in `connections`, so any id
        // that `connection_ids` or `unregister` can see is fully removable.
        self.user_index
            .entry(user_id)
            .or_default()
            .insert(connection_id.clone());

        match self.connections.entry(connection_id) {
            Entry::Occupied(_) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }

        Ok(())
    }

    /// Closes and removes one connection. Returns `false` when nothing matched,
    /// which makes repeated calls for the same handle harmless.
    pub async fn unregister(&self, user_id: &str, connection_id: &ConnectionId) -> bool {
        let handle = match self.connections.get(connection_id) {
            Some(entry) if entry.user_id() == user_id => Arc::clone(entry.value()),
            _ => return false,
        };

        handle.close().await;

        if self.connections.remove(connection_id).is_none() {
            // Another caller finished the removal while we were closing.
            return false;
        }
        self.live.fetch_sub(1, Ordering::AcqRel);

        if let Some(mut set) = self.user_index.get_mut(user_id) {
            set.remove(connection_id);
        }
        self.user_index.remove_if(user_id, |_, set| set.is_empty());

        true
    }

    /// Closes and removes every connection held by `user_id`. Returns how many were removed.
    pub async fn unregister_user(&self, user_id: &str) -> usize {
        let ids: Vec<ConnectionId> = match self.user_index.get(user_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return 0,
        };

        let mut removed = 0;
        for connection_id in &ids {
            if self.unregister(user_id, connection_id).await {
                removed += 1;
            }
        }
        removed
    }

    /// Point-in-time copy of a user's handles for fan-out.
    pub fn snapshot(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = match self.user_index.get(user_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return Vec::new(),
        };

        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|entry| Arc::clone(entry.value())))
            .collect()
    }

    /// Ids of every live connection, used during shutdown.
    pub fn connection_ids(&self) -> Vec<(UserId, ConnectionId)> {
        self.connections
            .iter()
            .map(|entry| (entry.user_id().to_string(), entry.key().clone()))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::io::{duplex, AsyncReadExt};

    fn handle(user: &str) -> Arc<ConnectionHandle> {
        ConnectionHandle::new(user, tokio::io::sink())
    }

    #[tokio::test]
    async fn test_capacity_scenario_two_devices_then_third_user() {
        let registry = SessionRegistry::new(2);
        let alice_phone = handle("alice");
        let alice_tablet = handle("alice");

        registry.register(alice_phone.clone()).unwrap();
        registry.register(alice_tablet.clone()).unwrap();
        assert_eq!(registry.connection_count("alice"), 2);

        let err = registry.register(handle("bob")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.connection_count("bob"), 0);

        assert!(registry.unregister("alice", alice_phone.id()).await);
        registry.register(handle("bob")).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.user_count(), 2);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent_and_closes_the_stream() {
        let registry = SessionRegistry::new(10);
        let (client, server) = duplex(64);
        let conn = ConnectionHandle::new("alice", server);
        registry.register(conn.clone()).unwrap();

        assert!(registry.unregister("alice", conn.id()).await);
        assert!(!registry.unregister("alice", conn.id()).await);
        assert!(conn.is_closed());
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.user_count(), 0, "empty user sets must not linger");

        // The peer sees EOF once the write half is shut down.
        let mut client = client;
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unregister_requires_matching_user() {
        let registry = SessionRegistry::new(10);
        let conn = handle("alice");
        registry.register(conn.clone()).unwrap();

        assert!(!registry.unregister("mallory", conn.id()).await);
        assert!(!conn.is_closed());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_each_connection_gets_its_own_slot() {
        let registry = SessionRegistry::new(10);
        let first = handle("alice");
        let second = handle("alice");
        assert_ne!(first.id(), second.id());

        registry.register(first.clone()).unwrap();
        registry.register(first.clone()).unwrap();
        registry.register(second).unwrap();

        assert_eq!(registry.len(), 2, "re-registering a handle must not take a slot");
        assert_eq!(registry.snapshot("alice").len(), 2);
    }

    #[tokio::test]
    async fn test_live_count_tracks_successful_registers_minus_matching_unregisters() {
        let registry = SessionRegistry::new(3);
        let mut registered = Vec::new();
        let mut successes = 0usize;
        let mut removals = 0usize;

        for i in 0..6 {
            let conn = handle(if i % 2 == 0 { "alice" } else { "bob" });
            if registry.register(conn.clone()).is_ok() {
                successes += 1;
                registered.push(conn);
            }
            assert!(registry.len() <= registry.max_connections());

            if i % 3 == 2 {
                let victim = registered.remove(0);
                if registry.unregister(victim.user_id(), victim.id()).await {
                    removals += 1;
                }
                // A second attempt never counts.
                assert!(!registry.unregister(victim.user_id(), victim.id()).await);
            }
            assert_eq!(registry.len(), successes - removals);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_never_overshoots_capacity() {
        let registry = Arc::new(SessionRegistry::new(5));
        let mut tasks = Vec::new();
        for i in 0..50 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.register(handle(&format!("user-{}", i % 7))).is_ok()
            }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 5);
        assert_eq!(registry.len(), 5);
    }

    #[tokio::test]
    async fn test_unregister_user_removes_every_handle() {
        let registry = SessionRegistry::new(10);
        let phone = handle("alice");
        let laptop = handle("alice");
        registry.register(phone.clone()).unwrap();
        registry.register(laptop.clone()).unwrap();
        registry.register(handle("bob")).unwrap();

        assert_eq!(registry.unregister_user("alice").await, 2);
        assert!(phone.is_closed() && laptop.is_closed());
        assert!(registry.snapshot("alice").is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.unregister_user("alice").await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let registry = SessionRegistry::new(10);
        let conn = handle("alice");
        registry.register(conn.clone()).unwrap();

        let snapshot = registry.snapshot("alice");
        registry.unregister("alice", conn.id()).await;

        assert_eq!(snapshot.len(), 1);
        assert!(registry.snapshot("alice").is_empty());
    }

    #[test]
    fn test_empty_user_id_is_rejected_without_taking_a_slot() {
        let registry = SessionRegistry::new(1);
        let err = registry.register(handle("")).unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::Protocol(ProtocolErrorKind::MissingUserId)
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_does_not_wait_for_a_peer_that_stopped_reading() {
        let registry = Arc::new(SessionRegistry::new(10));
        // The client half is kept alive but never read, so writes stall once
        // the small buffer fills.
        let (_client, server) = duplex(8);
        let conn = ConnectionHandle::with_write_timeout("alice", server, Duration::from_secs(60));
        registry.register(conn.clone()).unwrap();

        let writer = Arc::clone(&conn);
        let stalled = tokio::spawn(async move { writer.write_frame(&[b'x'; 64]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stalled.is_finished(), "write should be blocked on the full buffer");

        let removed = tokio::time::timeout(
            Duration::from_secs(2),
            registry.unregister("alice", conn.id()),
        )
        .await
        .expect("unregister must not wait behind the stalled write");
        assert!(removed);
        assert_eq!(registry.len(), 0);

        let err = tokio::time::timeout(Duration::from_secs(2), stalled)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_closes_the_handle() {
        let (_client, server) = duplex(8);
        let conn = ConnectionHandle::with_write_timeout("alice", server, Duration::from_millis(50));
        let mut closed = conn.closed_signal();

        let err = conn.write_frame(&[b'x'; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(conn.is_closed());
        assert!(closed.has_changed().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unregister_racing_register_leaves_no_dangling_index() {
        let registry = Arc::new(SessionRegistry::new(1000));

        let registering = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..300 {
                    registry.register(handle(&format!("user-{}", i % 5))).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let draining = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..300 {
                    for (user_id, connection_id) in registry.connection_ids() {
                        registry.unregister(&user_id, &connection_id).await;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        registering.await.unwrap();
        draining.await.unwrap();

        for (user_id, connection_id) in registry.connection_ids() {
            assert!(registry.unregister(&user_id, &connection_id).await);
        }
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.user_count(), 0, "no user may keep an index entry without connections");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let conn = handle("alice");
        conn.write_frame(b"one\n").await.unwrap();
        conn.close().await;
        conn.close().await;
        assert!(conn.write_frame(b"two\n").await.is_err());
    }
}
