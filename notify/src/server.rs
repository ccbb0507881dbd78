use crate::error::{ErrorKind, ProtocolErrorKind};
use crate::fanout::Notifier;
use crate::message::{
    datagram_type, decode_datagram, encode_datagram, ClientDatagram, RegisterRequest,
    RegisterResponse, ServerDatagram, UnregisterRequest,
};
use crate::registration::{Registration, RegistrationTable};
use log::*;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Applies one inbound datagram to the registration table and returns the
/// reply to send back, if any.
#[derive(Clone)]
pub struct DatagramHandler {
    table: Arc<RegistrationTable>,
    notifier: Notifier,
}

impl DatagramHandler {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            table: Arc::clone(notifier.table()),
            notifier,
        }
    }

    pub async fn handle(&self, data: &[u8], peer: SocketAddr) -> Option<RegisterResponse> {
        match decode_datagram(data) {
            Ok(ClientDatagram::Register(request)) => Some(self.on_register(request, peer)),
            Ok(ClientDatagram::Unregister(request)) => Some(self.on_unregister(request, peer)),
            Ok(ClientDatagram::Release(release)) => {
                debug!(
                    "Release trigger from {peer} for topic {} milestone {}",
                    release.topic_id, release.milestone
                );
                self.notifier.publish_release(release).await;
                None
            }
            Err(e) if e.kind() == ErrorKind::Protocol(ProtocolErrorKind::UnknownType) => {
                warn!("Dropping datagram from {peer}: {e}");
                None
            }
            Err(e) => {
                warn!("Dropping malformed datagram from {peer}: {e}");
                let is_register = datagram_type(data).is_ok_and(|t| t == "register");
                is_register.then(|| RegisterResponse::error("invalid_register_payload"))
            }
        }
    }

    fn on_register(&self, request: RegisterRequest, peer: SocketAddr) -> RegisterResponse {
        if request.user_id.is_empty() {
            return RegisterResponse::error("missing_user_id");
        }

        let registration = Registration {
            preferences: request.preferences,
            client_label: request.client_label,
            ..Registration::new(request.user_id, peer, request.topic_ids)
        };
        info!(
            "Registered {} at {peer} (topics={:?}, label={:?})",
            registration.user_id, registration.topic_ids, registration.client_label
        );
        if let Some(previous) = self.table.upsert(registration) {
            if previous.address != peer {
                debug!("Replaced registration of {} at {}", previous.user_id, previous.address);
            }
        }

        RegisterResponse::ok("registered")
    }

    fn on_unregister(&self, request: UnregisterRequest, peer: SocketAddr) -> RegisterResponse {
        if request.user_id.is_empty() {
            return RegisterResponse::error("missing_user_id");
        }

        let removed = self.table.remove(&request.user_id, &request.topic_ids);
        info!(
            "Unregistered {} from {peer} (topics={:?}, removed={removed})",
            request.user_id, request.topic_ids
        );
        RegisterResponse::ok("unregistered")
    }
}

/// Receive loop for the best-effort channel.
pub struct Server {
    socket: Arc<UdpSocket>,
    handler: DatagramHandler,
    max_datagram_size: usize,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        table: Arc<RegistrationTable>,
        max_datagram_size: usize,
    ) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let notifier = Notifier::new(table, socket.clone());
        Ok(Self {
            socket,
            handler: DatagramHandler::new(notifier),
            max_datagram_size: max_datagram_size.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Notifier sharing this server's socket, for releases published by the API layer.
    pub fn notifier(&self) -> Notifier {
        self.handler.notifier.clone()
    }

    /// Receives datagrams until `shutdown` turns true. A bad packet or a
    /// receive error never ends the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let local = self
            .socket
            .local_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        info!("Notification server listening on {local}");

        let mut buf = vec![0u8; self.max_datagram_size];

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (len, peer) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Failed to receive datagram: {e}");
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Some(response) = self.handler.handle(&buf[..len], peer).await {
                self.reply(response, peer).await;
            }
        }

        info!("Notification server stopped");
    }

    async fn reply(&self, response: RegisterResponse, peer: SocketAddr) {
        let payload = match encode_datagram(&ServerDatagram::RegisterResponse(response)) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize reply for {peer}: {e}");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&payload, peer).await {
            warn!("Failed to send reply to {peer}: {e}");
        }
    }
}
