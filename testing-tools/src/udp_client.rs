use anyhow::{bail, Result};
use log::*;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// A best-effort channel client bound to its own local port.
pub struct Endpoint {
    pub label: String,
    socket: UdpSocket,
    server: SocketAddr,
}

impl Endpoint {
    pub async fn bind(server: SocketAddr, label: impl Into<String>) -> Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(local).await?;

        Ok(Self {
            label: label.into(),
            socket,
            server,
        })
    }

    pub async fn send(&self, datagram: &Value) -> Result<()> {
        self.socket
            .send_to(datagram.to_string().as_bytes(), self.server)
            .await?;
        debug!("{} sent {datagram}", self.label);
        Ok(())
    }

    /// Skips datagrams until one of `datagram_type` arrives.
    pub async fn wait_for(&self, datagram_type: &str, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("{}: timeout waiting for {datagram_type}", self.label);
            }

            let Ok(received) = tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await
            else {
                bail!("{}: timeout waiting for {datagram_type}", self.label);
            };
            let (len, _) = received?;

            match serde_json::from_slice::<Value>(&buf[..len]) {
                Ok(value) if value["type"] == datagram_type => return Ok(value),
                Ok(value) => debug!("{} skipping {value}", self.label),
                Err(e) => warn!("{} received invalid JSON: {e}", self.label),
            }
        }
    }

    /// True when no datagram of `datagram_type` arrives within `window`.
    pub async fn stays_silent(&self, datagram_type: &str, window: Duration) -> bool {
        self.wait_for(datagram_type, window).await.is_err()
    }
}
