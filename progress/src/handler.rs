//! Per-connection protocol state machine.
//!
//! `Connecting -> Authenticating -> Registered -> Closed`, or straight from
//! `Authenticating` to `Closed` when the handshake is refused.

use crate::connection::{
    ConnectionHandle, ConnectionId, SessionRegistry, UserId, DEFAULT_WRITE_TIMEOUT,
};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorKind};
use crate::message::{
    decode_auth, decode_client_frame, encode_frame, AuthResponse, ClientFrame, ServerFrame,
};
use log::*;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::watch;
use tokio::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Registered,
    Closed,
}

/// What happened over the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub user_id: Option<UserId>,
    pub registered: bool,
    /// Reason sent in the negative acknowledgment, if the handshake was refused.
    pub rejected: Option<&'static str>,
    pub updates_forwarded: usize,
}

pub struct ConnectionHandler {
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    shutdown: watch::Receiver<bool>,
    peer: String,
    state: ConnectionState,
}

impl ConnectionHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        dispatcher: Dispatcher,
        shutdown: watch::Receiver<bool>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            shutdown,
            peer: peer.into(),
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drives the connection until it closes. Never returns an error: every
    /// failure is local to this connection and ends in `Closed`.
    pub async fn run<R, W>(mut self, reader: R, mut writer: W) -> ConnectionSummary
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut summary = ConnectionSummary {
            user_id: None,
            registered: false,
            rejected: None,
            updates_forwarded: 0,
        };
        let mut lines = BufReader::new(reader).lines();

        self.transition(ConnectionState::Authenticating, None);

        let first = tokio::select! {
            line = lines.next_line() => line,
            _ = self.shutdown.changed() => {
                self.transition(ConnectionState::Closed, None);
                return summary;
            }
        };

        let line = match first {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Peer {} closed before authenticating", self.peer);
                self.transition(ConnectionState::Closed, None);
                return summary;
            }
            Err(e) => {
                warn!("Failed to read auth record from {}: {e}", self.peer);
                self.transition(ConnectionState::Closed, None);
                return summary;
            }
        };

        let user_id = match decode_auth(&line) {
            Ok(user_id) => user_id,
            Err(e) => {
                summary.rejected = Some(e.kind().reason());
                self.reject(&mut writer, &e).await;
                return summary;
            }
        };
        summary.user_id = Some(user_id.clone());

        let handle = ConnectionHandle::new(user_id.clone(), writer);
        // Armed before registering so a cancelled task never leaks its slot.
        let guard = RegistrationGuard::new(Arc::clone(&self.registry), &handle);
        if let Err(e) = self.register_and_ack(&handle).await {
            if e.kind() != ErrorKind::Transport {
                summary.rejected = Some(e.kind().reason());
            }
            guard.release().await;
            self.transition(ConnectionState::Closed, Some(&user_id));
            return summary;
        }
        summary.registered = true;

        self.transition(ConnectionState::Registered, Some(&user_id));

        summary.updates_forwarded = self.read_loop(&mut lines, &handle).await;

        guard.release().await;
        self.transition(ConnectionState::Closed, Some(&user_id));
        info!(
            "User {} disconnected from {} (connection {}, {} update(s) forwarded)",
            user_id,
            self.peer,
            handle.id(),
            summary.updates_forwarded
        );
        summary
    }

    /// Registers the handle and writes the positive acknowledgment while
    /// holding the write lock, so no broadcast can reach the peer first.
    async fn register_and_ack(&self, handle: &Arc<ConnectionHandle>) -> Result<(), Error> {
        let mut writer = handle.lock_writer().await;

        if let Err(e) = self.registry.register(Arc::clone(handle)) {
            warn!(
                "Refusing user {} from {}: {e}",
                handle.user_id(),
                self.peer
            );
            let response = ServerFrame::AuthResponse(AuthResponse::rejected(e.kind().reason()));
            if let Err(e) = send_frame(&mut *writer, &response, handle.write_timeout()).await {
                debug!("Could not deliver rejection to {}: {e}", self.peer);
            }
            drop(writer);
            handle.close().await;
            return Err(e);
        }

        let ack = send_frame(
            &mut *writer,
            &ServerFrame::AuthResponse(AuthResponse::ok()),
            handle.write_timeout(),
        )
        .await;
        drop(writer);

        if let Err(e) = ack {
            warn!(
                "Failed to acknowledge user {} on connection {}: {e}",
                handle.user_id(),
                handle.id()
            );
            self.registry.unregister(handle.user_id(), handle.id()).await;
            return Err(e.into());
        }

        info!(
            "User {} connected from {} (connection {}, {} live)",
            handle.user_id(),
            self.peer,
            handle.id(),
            self.registry.len()
        );
        Ok(())
    }

    async fn read_loop<R>(&mut self, lines: &mut Lines<BufReader<R>>, handle: &ConnectionHandle) -> usize
    where
        R: AsyncRead + Unpin,
    {
        let mut forwarded = 0;
        let mut closed = handle.closed_signal();

        if *self.shutdown.borrow() || handle.is_closed() {
            return forwarded;
        }

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = self.shutdown.changed() => {
                    debug!("Server shutdown closing connection {}", handle.id());
                    break;
                }
                _ = closed.changed() => {
                    debug!("Connection {} was closed by the registry", handle.id());
                    break;
                }
            };

            match line {
                Ok(Some(line)) => {
                    if self.on_frame(handle.user_id(), handle.id(), &line).await {
                        forwarded += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Read error on connection {}: {e}", handle.id());
                    break;
                }
            }
        }

        forwarded
    }

    /// Handles one post-authentication record. Returns true when an update was enqueued.
    async fn on_frame(&self, user_id: &str, connection_id: &ConnectionId, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }

        match decode_client_frame(line) {
            Ok(ClientFrame::Progress(mut update)) => {
                if !update.user_id.is_empty() && update.user_id != user_id {
                    debug!(
                        "Connection {connection_id} sent user_id {} but is authenticated as {user_id}; overriding",
                        update.user_id
                    );
                }
                update.user_id = user_id.to_string();

                debug!(
                    "Received progress from {user_id}: content={}, position={}",
                    update.content_id, update.position
                );

                match self.dispatcher.publish(user_id, update).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Could not enqueue progress from {user_id}: {e}");
                        false
                    }
                }
            }
            Ok(ClientFrame::Auth(_)) => {
                debug!("Ignoring repeated auth record on connection {connection_id}");
                false
            }
            Ok(ClientFrame::Unknown(frame_type)) => {
                warn!("Skipping record of unknown type {frame_type:?} from {user_id}");
                false
            }
            Err(e) => {
                warn!("Skipping malformed record from {user_id}: {e}");
                false
            }
        }
    }

    async fn reject<W>(&mut self, writer: &mut W, error: &Error)
    where
        W: AsyncWrite + Unpin,
    {
        let reason = error.kind().reason();
        warn!("Rejecting connection from {}: {reason} ({error})", self.peer);

        let response = ServerFrame::AuthResponse(AuthResponse::rejected(reason));
        if let Err(e) = send_frame(writer, &response, DEFAULT_WRITE_TIMEOUT).await {
            debug!("Could not deliver rejection to {}: {e}", self.peer);
        }
        match time::timeout(DEFAULT_WRITE_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown of rejected connection from {} reported: {e}", self.peer),
            Err(_) => debug!("Shutdown of rejected connection from {} timed out", self.peer),
        }

        self.transition(ConnectionState::Closed, None);
    }

    fn transition(&mut self, next: ConnectionState, user_id: Option<&str>) {
        debug!(
            "Connection from {} ({}): {:?} -> {:?}",
            self.peer,
            user_id.unwrap_or("unauthenticated"),
            self.state,
            next
        );
        self.state = next;
    }
}

async fn send_frame<W>(writer: &mut W, frame: &ServerFrame, limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_frame(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let write = async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    };
    time::timeout(limit, write)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer stopped reading"))?
}

/// Unregisters a handle when dropped unless `release` already did.
///
/// Covers task cancellation and panics inside the read loop.
struct RegistrationGuard {
    registry: Arc<SessionRegistry>,
    user_id: UserId,
    connection_id: ConnectionId,
    armed: bool,
}

impl RegistrationGuard {
    fn new(registry: Arc<SessionRegistry>, handle: &ConnectionHandle) -> Self {
        Self {
            registry,
            user_id: handle.user_id().to_string(),
            connection_id: handle.id().clone(),
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        self.registry
            .unregister(&self.user_id, &self.connection_id)
            .await;
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let user_id = std::mem::take(&mut self.user_id);
        let connection_id = self.connection_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    registry.unregister(&user_id, &connection_id).await;
                });
            }
            Err(_) => error!("Connection {connection_id} dropped outside a runtime; leaving it registered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AuthStatus, ProgressUpdate};
    use std::time::Duration;
    use tokio::io::{duplex, split, AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::task::JoinHandle;

    struct Harness {
        registry: Arc<SessionRegistry>,
        dispatcher: Dispatcher,
        shutdown: watch::Sender<bool>,
    }

    impl Harness {
        fn new(max_connections: usize) -> Self {
            let registry = Arc::new(SessionRegistry::new(max_connections));
            let (dispatcher, _worker) = Dispatcher::start(Arc::clone(&registry), 16);
            let (shutdown, _) = watch::channel(false);
            Self {
                registry,
                dispatcher,
                shutdown,
            }
        }

        /// Starts a handler on one end of an in-memory stream and returns the client end.
        fn connect(&self) -> (DuplexStream, JoinHandle<ConnectionSummary>) {
            let (client, server) = duplex(4096);
            let (read_half, write_half) = split(server);
            let handler = ConnectionHandler::new(
                Arc::clone(&self.registry),
                self.dispatcher.clone(),
                self.shutdown.subscribe(),
                "test-peer",
            );
            let task = tokio::spawn(handler.run(read_half, write_half));
            (client, task)
        }
    }

    async fn read_frame(lines: &mut tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>) -> ServerFrame {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("stream closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn authenticate(
        harness: &Harness,
        user: &str,
    ) -> (
        tokio::io::WriteHalf<DuplexStream>,
        tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        JoinHandle<ConnectionSummary>,
    ) {
        let (client, task) = harness.connect();
        let (read, mut write) = split(client);
        let mut lines = BufReader::new(read).lines();
        write
            .write_all(format!("{{\"type\":\"auth\",\"user_id\":\"{user}\"}}\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut lines).await,
            ServerFrame::AuthResponse(AuthResponse::ok())
        );
        (write, lines, task)
    }

    #[tokio::test]
    async fn test_empty_user_id_is_refused_without_registering() {
        let harness = Harness::new(10);
        let (client, task) = harness.connect();
        let (read, mut write) = split(client);
        let mut lines = BufReader::new(read).lines();

        write
            .write_all(b"{\"type\":\"auth\",\"user_id\":\"\"}\n")
            .await
            .unwrap();

        match read_frame(&mut lines).await {
            ServerFrame::AuthResponse(response) => {
                assert_eq!(response.status, AuthStatus::Error);
                assert_eq!(response.error.as_deref(), Some("missing_user_id"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(lines.next_line().await.unwrap().is_none(), "stream must be closed");

        let summary = task.await.unwrap();
        assert!(!summary.registered);
        assert_eq!(summary.rejected, Some("missing_user_id"));
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn test_first_record_must_be_auth() {
        let harness = Harness::new(10);
        let (client, task) = harness.connect();
        let (read, mut write) = split(client);
        let mut lines = BufReader::new(read).lines();

        write
            .write_all(b"{\"type\":\"progress\",\"content_id\":\"c1\",\"position\":1}\n")
            .await
            .unwrap();

        let frame = read_frame(&mut lines).await;
        assert_eq!(
            frame,
            ServerFrame::AuthResponse(AuthResponse::rejected("expected_auth_message"))
        );
        assert_eq!(task.await.unwrap().rejected, Some("expected_auth_message"));
    }

    #[tokio::test]
    async fn test_capacity_rejection_is_explicit() {
        let harness = Harness::new(1);
        let (_write, _lines, _task) = authenticate(&harness, "alice").await;

        let (client, task) = harness.connect();
        let (read, mut write) = split(client);
        let mut lines = BufReader::new(read).lines();
        write
            .write_all(b"{\"type\":\"auth\",\"user_id\":\"bob\"}\n")
            .await
            .unwrap();

        assert_eq!(
            read_frame(&mut lines).await,
            ServerFrame::AuthResponse(AuthResponse::rejected("server_at_capacity"))
        );
        let summary = task.await.unwrap();
        assert_eq!(summary.rejected, Some("server_at_capacity"));
        assert_eq!(harness.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_update_reaches_all_sessions_of_the_user_with_identity_forced() {
        let harness = Harness::new(10);
        let (mut phone, mut phone_lines, _t1) = authenticate(&harness, "alice").await;
        let (_tablet, mut tablet_lines, _t2) = authenticate(&harness, "alice").await;

        phone
            .write_all(b"{\"type\":\"typing\"}\nnot json\n{\"type\":\"progress\",\"user_id\":\"mallory\",\"content_id\":\"c1\",\"position\":5}\n")
            .await
            .unwrap();

        for lines in [&mut phone_lines, &mut tablet_lines] {
            match read_frame(lines).await {
                ServerFrame::Progress(update) => {
                    assert_eq!(update.user_id, "alice");
                    assert_eq!(update.content_id, "c1");
                    assert_eq!(update.position, 5);
                    assert!(update.timestamp.unwrap() > 0);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let harness = Harness::new(10);
        let (write, lines, task) = authenticate(&harness, "alice").await;
        assert_eq!(harness.registry.connection_count("alice"), 1);

        drop(write);
        drop(lines);
        let summary = task.await.unwrap();

        assert!(summary.registered);
        assert!(harness.registry.is_empty());
        assert_eq!(harness.registry.user_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_removal_ends_the_read_loop() {
        let harness = Harness::new(10);
        let (_write, mut lines, task) = authenticate(&harness, "alice").await;

        assert_eq!(harness.registry.unregister_user("alice").await, 1);

        let summary = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(summary.registered);
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes_registered_connections() {
        let harness = Harness::new(10);
        let (_write, _lines, task) = authenticate(&harness, "alice").await;

        harness.shutdown.send_replace(true);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn test_aborted_handler_is_cleaned_up_by_guard() {
        let harness = Harness::new(10);
        let (_write, _lines, task) = authenticate(&harness, "alice").await;

        task.abort();
        let _ = task.await;

        for _ in 0..50 {
            if harness.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn test_api_publish_reaches_authenticated_session() {
        let harness = Harness::new(10);
        let (_write, mut lines, _task) = authenticate(&harness, "alice").await;

        harness
            .dispatcher
            .publish("alice", ProgressUpdate::new("", "c9", 42))
            .await
            .unwrap();

        match read_frame(&mut lines).await {
            ServerFrame::Progress(update) => assert_eq!(update.position, 42),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
