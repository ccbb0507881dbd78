use anyhow::{bail, Context, Result};
use log::*;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// One reliable-channel session, as a device would hold it.
pub struct Connection {
    pub label: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub async fn connect(addr: SocketAddr, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("{label}: failed to connect to {addr}"))?;
        let (read, writer) = stream.into_split();
        debug!("{label} connected to {addr}");

        Ok(Self {
            label,
            lines: BufReader::new(read).lines(),
            writer,
        })
    }

    pub async fn send(&mut self, record: &Value) -> Result<()> {
        let mut line = record.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        debug!("{} sent {record}", self.label);
        Ok(())
    }

    /// Sends the auth record and returns the server's reply, whatever its status.
    pub async fn authenticate(&mut self, user_id: &str, timeout: Duration) -> Result<Value> {
        self.send(&json!({"type": "auth", "user_id": user_id}))
            .await?;
        self.wait_for("auth_response", timeout).await
    }

    /// Next record, or `None` once the server closed the stream.
    pub async fn next_record(&mut self, timeout: Duration) -> Result<Option<Value>> {
        let line = tokio::time::timeout(timeout, self.lines.next_line())
            .await
            .with_context(|| format!("{}: timed out waiting for a record", self.label))??;

        match line {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    /// Skips records until one of `record_type` arrives.
    pub async fn wait_for(&mut self, record_type: &str, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("{}: timeout waiting for {record_type}", self.label);
            }

            match self.next_record(remaining).await? {
                Some(record) if record["type"] == record_type => return Ok(record),
                Some(record) => debug!("{} skipping {record}", self.label),
                None => bail!("{}: connection closed", self.label),
            }
        }
    }
}
