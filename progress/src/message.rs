//! Newline-delimited JSON records exchanged on the reliable channel.

use crate::error::{protocol_error, Error, ProtocolErrorKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// First record a client sends after connecting.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub user_id: String,
    /// Reserved for token-based authentication; accepted and ignored.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Ok,
    Error,
}

/// Server reply to an [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub status: AuthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthResponse {
    pub fn ok() -> Self {
        Self {
            status: AuthStatus::Ok,
            error: None,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            status: AuthStatus::Error,
            error: Some(reason.to_string()),
        }
    }
}

/// A single reading-progress change. Sent by clients and broadcast by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Overwritten with the authenticated identity before dispatch.
    #[serde(default)]
    pub user_id: String,
    #[serde(alias = "manga_id")]
    pub content_id: String,
    #[serde(alias = "chapter")]
    pub position: i64,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl ProgressUpdate {
    pub fn new(user_id: impl Into<String>, content_id: impl Into<String>, position: i64) -> Self {
        Self {
            user_id: user_id.into(),
            content_id: content_id.into(),
            position,
            timestamp: None,
        }
    }

    /// Fills in server time when the timestamp is missing or zero.
    pub fn stamped(mut self) -> Self {
        if self.timestamp.unwrap_or(0) == 0 {
            self.timestamp = Some(Utc::now().timestamp());
        }
        self
    }
}

/// Records the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthResponse(AuthResponse),
    Progress(ProgressUpdate),
}

/// Records a client may send, as understood by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Auth(AuthRequest),
    Progress(ProgressUpdate),
    /// Well-formed JSON carrying a type this server does not handle.
    Unknown(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    frame_type: String,
}

/// Parses one line into a [`ClientFrame`].
///
/// Invalid JSON, or a known type with missing fields, is a protocol error.
/// Valid JSON with an unrecognized `type` is returned as `Unknown`.
pub fn decode_client_frame(line: &str) -> Result<ClientFrame, Error> {
    let envelope: Envelope = serde_json::from_str(line)?;
    match envelope.frame_type.as_str() {
        "auth" => Ok(ClientFrame::Auth(serde_json::from_str(line)?)),
        "progress" => Ok(ClientFrame::Progress(serde_json::from_str(line)?)),
        other => Ok(ClientFrame::Unknown(other.to_string())),
    }
}

/// Validates the first record of a connection and returns the user identity it carries.
pub fn decode_auth(line: &str) -> Result<String, Error> {
    let frame = decode_client_frame(line).map_err(|e| Error {
        source: e.source,
        error_kind: crate::error::ErrorKind::Protocol(ProtocolErrorKind::InvalidAuthMessage),
    })?;

    match frame {
        ClientFrame::Auth(auth) => {
            let user_id = auth.user_id.trim();
            if user_id.is_empty() {
                Err(protocol_error(
                    ProtocolErrorKind::MissingUserId,
                    "auth record has no user_id",
                ))
            } else {
                Ok(user_id.to_string())
            }
        }
        ClientFrame::Progress(_) | ClientFrame::Unknown(_) => Err(protocol_error(
            ProtocolErrorKind::ExpectedAuthMessage,
            "first record must be of type auth",
        )),
    }
}

/// Serializes a frame as one JSON line including the trailing newline.
pub fn encode_frame(frame: &ServerFrame) -> Result<Vec<u8>, Error> {
    let mut data = serde_json::to_vec(frame)?;
    data.push(b'\n');
    Ok(data)
}
