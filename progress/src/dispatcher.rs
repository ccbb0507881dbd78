use crate::connection::SessionRegistry;
use crate::error::{dispatcher_closed, protocol_error, Error, ProtocolErrorKind};
use crate::message::{encode_frame, ProgressUpdate, ServerFrame};
use log::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome of delivering one update to the connections in a snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Single funnel for progress updates.
///
/// Any number of producers enqueue through cloned `Dispatcher` handles; one
/// worker task drains the bounded queue in FIFO order. When the queue is
/// full, `publish` waits instead of dropping the update.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<ProgressUpdate>,
}

impl Dispatcher {
    /// Spawns the dispatch worker. The worker exits once every `Dispatcher`
    /// clone has been dropped and the queue is drained.
    pub fn start(registry: Arc<SessionRegistry>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(registry, receiver));
        (Self { sender }, worker)
    }

    /// Enqueues an update for every live connection of `user_id`.
    ///
    /// The user identity on `update` is replaced by `user_id` and a missing
    /// timestamp is filled with server time.
    pub async fn publish(&self, user_id: &str, mut update: ProgressUpdate) -> Result<(), Error> {
        if user_id.is_empty() {
            return Err(protocol_error(
                ProtocolErrorKind::MissingUserId,
                "publish requires a user_id",
            ));
        }
        update.user_id = user_id.to_string();

        self.sender
            .send(update.stamped())
            .await
            .map_err(|_| dispatcher_closed())
    }

    /// Free slots left in the queue.
    pub fn available_capacity(&self) -> usize {
        self.sender.capacity()
    }
}

async fn run_worker(registry: Arc<SessionRegistry>, mut receiver: mpsc::Receiver<ProgressUpdate>) {
    info!("Progress dispatch worker started");

    while let Some(update) = receiver.recv().await {
        let report = fan_out(&registry, &update).await;

        if report.attempted == 0 {
            debug!(
                "Dropped progress update for user {} (content={}, position={}): no active connections",
                update.user_id, update.content_id, update.position
            );
        } else {
            info!(
                "Broadcast progress update to user {} (content={}, position={}): {} of {} connection(s)",
                update.user_id, update.content_id, update.position, report.delivered, report.attempted
            );
        }
    }

    info!("Progress dispatch worker stopped");
}

/// Writes `update` to every connection in the user's current snapshot.
///
/// A failed write is logged and skipped; it never stops delivery to the
/// remaining connections.
pub async fn fan_out(registry: &SessionRegistry, update: &ProgressUpdate) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    let frame = match encode_frame(&ServerFrame::Progress(update.clone())) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Failed to serialize progress update for user {}: {e}", update.user_id);
            return report;
        }
    };

    for handle in registry.snapshot(&update.user_id) {
        report.attempted += 1;
        match handle.write_frame(&frame).await {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    "Failed to send progress update to user {} on connection {}: {e}",
                    update.user_id,
                    handle.id()
                );
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::error::ErrorKind;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWrite, BufReader};

    /// Writer that counts attempts and always fails.
    struct FailingWriter {
        attempts: Arc<AtomicUsize>,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_reduce_attempts_to_other_connections() {
        let registry = SessionRegistry::new(10);
        let failing_attempts = Arc::new(AtomicUsize::new(0));

        let mut readers = Vec::new();
        for _ in 0..2 {
            let (client, server) = duplex(1024);
            registry.register(ConnectionHandle::new("alice", server)).unwrap();
            readers.push(BufReader::new(client));
        }
        for _ in 0..2 {
            registry
                .register(ConnectionHandle::new(
                    "alice",
                    FailingWriter {
                        attempts: Arc::clone(&failing_attempts),
                    },
                ))
                .unwrap();
        }

        let update = ProgressUpdate::new("alice", "c1", 5).stamped();
        let report = fan_out(&registry, &update).await;

        assert_eq!(
            report,
            DeliveryReport {
                attempted: 4,
                delivered: 2,
                failed: 2
            }
        );
        assert_eq!(failing_attempts.load(Ordering::SeqCst), 2);

        for reader in &mut readers {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let frame: ServerFrame = serde_json::from_str(&line).unwrap();
            assert_eq!(frame, ServerFrame::Progress(update.clone()));
        }
    }

    #[tokio::test]
    async fn test_peer_that_stops_reading_does_not_stall_the_worker() {
        let registry = Arc::new(SessionRegistry::new(10));

        // Never read, so its tiny buffer fills on the first frame.
        let (_stalled_client, stalled_server) = duplex(8);
        let stalled = ConnectionHandle::with_write_timeout(
            "alice",
            stalled_server,
            Duration::from_millis(100),
        );
        registry.register(stalled.clone()).unwrap();

        let (alice_client, alice_server) = duplex(4096);
        registry.register(ConnectionHandle::new("alice", alice_server)).unwrap();
        let (bob_client, bob_server) = duplex(4096);
        registry.register(ConnectionHandle::new("bob", bob_server)).unwrap();

        let (dispatcher, worker) = Dispatcher::start(Arc::clone(&registry), 4);
        dispatcher
            .publish("alice", ProgressUpdate::new("", "c1", 1))
            .await
            .unwrap();
        dispatcher
            .publish("bob", ProgressUpdate::new("", "c2", 2))
            .await
            .unwrap();

        let mut bob_lines = BufReader::new(bob_client).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), bob_lines.next_line())
            .await
            .expect("later events must not wait behind the stalled peer")
            .unwrap()
            .unwrap();
        assert!(line.contains("\"c2\""));

        let mut alice_lines = BufReader::new(alice_client).lines();
        let line = alice_lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"c1\""));

        // The stalled connection was closed and can be removed without blocking.
        assert!(stalled.is_closed());
        let removed = tokio::time::timeout(
            Duration::from_secs(2),
            registry.unregister("alice", stalled.id()),
        )
        .await
        .unwrap();
        assert!(removed);
        assert_eq!(registry.connection_count("alice"), 1);

        drop(dispatcher);
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_without_connections_is_not_an_error() {
        let registry = SessionRegistry::new(10);
        let report = fan_out(&registry, &ProgressUpdate::new("alice", "c1", 5)).await;
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_publish_for_user_without_connections_returns_ok() {
        let registry = Arc::new(SessionRegistry::new(10));
        let (dispatcher, worker) = Dispatcher::start(Arc::clone(&registry), 4);

        dispatcher
            .publish("alice", ProgressUpdate::new("", "c1", 5))
            .await
            .unwrap();

        drop(dispatcher);
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_only_reaches_the_target_user_in_order() {
        let registry = Arc::new(SessionRegistry::new(10));
        let (alice_client, alice_server) = duplex(4096);
        let (bob_client, bob_server) = duplex(4096);
        registry.register(ConnectionHandle::new("alice", alice_server)).unwrap();
        registry.register(ConnectionHandle::new("bob", bob_server)).unwrap();

        let (dispatcher, worker) = Dispatcher::start(Arc::clone(&registry), 2);
        for position in 1..=5 {
            dispatcher
                .publish("alice", ProgressUpdate::new("spoofed", "c1", position))
                .await
                .unwrap();
        }
        drop(dispatcher);
        worker.await.unwrap();

        let mut lines = BufReader::new(alice_client).lines();
        for expected in 1..=5 {
            let line = lines.next_line().await.unwrap().unwrap();
            match serde_json::from_str::<ServerFrame>(&line).unwrap() {
                ServerFrame::Progress(update) => {
                    assert_eq!(update.user_id, "alice");
                    assert_eq!(update.position, expected);
                    assert!(update.timestamp.is_some());
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }

        // Bob's connection never saw alice's traffic.
        drop(registry);
        let mut bob_lines = BufReader::new(bob_client).lines();
        let pending = tokio::time::timeout(Duration::from_millis(50), bob_lines.next_line()).await;
        assert!(!matches!(pending, Ok(Ok(Some(_)))));
    }

    #[tokio::test]
    async fn test_publish_rejects_empty_user() {
        let registry = Arc::new(SessionRegistry::new(1));
        let (dispatcher, _worker) = Dispatcher::start(registry, 1);
        let err = dispatcher
            .publish("", ProgressUpdate::new("", "c1", 1))
            .await
            .unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::Protocol(ProtocolErrorKind::MissingUserId)
        );
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        // No worker drains this queue.
        let (sender, _receiver) = mpsc::channel(1);
        let dispatcher = Dispatcher { sender };

        dispatcher
            .publish("alice", ProgressUpdate::new("", "c1", 1))
            .await
            .unwrap();
        assert_eq!(dispatcher.available_capacity(), 0);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            dispatcher.publish("alice", ProgressUpdate::new("", "c1", 2)),
        )
        .await;
        assert!(blocked.is_err(), "second publish should wait for queue space");
    }
}
