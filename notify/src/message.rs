//! JSON datagrams exchanged on the best-effort channel. One record per datagram.

use crate::error::{protocol_error, Error, ProtocolErrorKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub user_id: String,
    /// Topics to be notified about. Empty means every topic.
    #[serde(default, alias = "manga_ids")]
    pub topic_ids: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
    #[serde(default)]
    pub client_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UnregisterRequest {
    #[serde(default)]
    pub user_id: String,
    /// Empty removes every registration of the user.
    #[serde(default, alias = "manga_ids")]
    pub topic_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Reply to a register or unregister datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: ResponseStatus,
    pub message: String,
}

impl RegisterResponse {
    pub fn ok(message: &str) -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: message.to_string(),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.to_string(),
        }
    }
}

/// A topic reaching a new milestone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseNotification {
    #[serde(alias = "manga_id")]
    pub topic_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(alias = "chapter")]
    pub milestone: i64,
    #[serde(default)]
    pub message: String,
    /// Unix seconds; zero until stamped.
    #[serde(default)]
    pub timestamp: i64,
}

impl ReleaseNotification {
    pub fn new(
        topic_id: impl Into<String>,
        title: impl Into<String>,
        milestone: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            topic_id: topic_id.into(),
            title: title.into(),
            milestone,
            message: message.into(),
            timestamp: 0,
        }
    }

    /// Fills in server time when the timestamp is zero.
    pub fn stamped(mut self) -> Self {
        if self.timestamp == 0 {
            self.timestamp = Utc::now().timestamp();
        }
        self
    }
}

/// Datagrams the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerDatagram {
    RegisterResponse(RegisterResponse),
    Release(ReleaseNotification),
}

/// Datagrams a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientDatagram {
    Register(RegisterRequest),
    Unregister(UnregisterRequest),
    /// Administrative trigger for a release fan-out.
    Release(ReleaseNotification),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    datagram_type: String,
}

/// Reads only the `type` field.
pub fn datagram_type(data: &[u8]) -> Result<String, Error> {
    let envelope: Envelope = serde_json::from_slice(data)?;
    Ok(envelope.datagram_type)
}

pub fn decode_datagram(data: &[u8]) -> Result<ClientDatagram, Error> {
    match datagram_type(data)?.as_str() {
        "register" => Ok(ClientDatagram::Register(serde_json::from_slice(data)?)),
        "unregister" => Ok(ClientDatagram::Unregister(serde_json::from_slice(data)?)),
        "release" | "chapter_release" => {
            Ok(ClientDatagram::Release(serde_json::from_slice(data)?))
        }
        other => Err(protocol_error(
            ProtocolErrorKind::UnknownType,
            &format!("unknown datagram type {other:?}"),
        )),
    }
}

pub fn encode_datagram(datagram: &ServerDatagram) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(datagram)?)
}
