use crate::message::{encode_datagram, ReleaseNotification, ServerDatagram};
use crate::registration::RegistrationTable;
use async_trait::async_trait;
use log::*;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Something that can send one datagram to an address.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, payload, target).await
    }
}

/// Outcome of one release fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Pushes release notifications to every registered address. At most once, no retries.
#[derive(Clone)]
pub struct Notifier {
    table: Arc<RegistrationTable>,
    sink: Arc<dyn DatagramSink>,
}

impl Notifier {
    pub fn new(table: Arc<RegistrationTable>, sink: Arc<dyn DatagramSink>) -> Self {
        Self { table, sink }
    }

    pub fn table(&self) -> &Arc<RegistrationTable> {
        &self.table
    }

    /// Sends `release` to every current registration. Per-recipient failures
    /// are logged and counted, never returned.
    pub async fn publish_release(&self, release: ReleaseNotification) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let release = release.stamped();

        let payload = match encode_datagram(&ServerDatagram::Release(release.clone())) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize release for topic {}: {e}", release.topic_id);
                return report;
            }
        };

        for registration in self.table.snapshot_all() {
            report.attempted += 1;
            match self.sink.send_to(&payload, registration.address).await {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        "Failed to send release to {} (user={}): {e}",
                        registration.address, registration.user_id
                    );
                }
            }
        }

        info!(
            "Broadcast release for topic {} milestone {} to {} of {} client(s)",
            release.topic_id, release.milestone, report.delivered, report.attempted
        );
        report
    }
}
