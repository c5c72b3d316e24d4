//! Wire protocol between terminal clients and the relay.
//!
//! Every frame is a JSON text message tagged by `type`. Byte payloads are
//! base64 encoded (standard alphabet, padded).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Handshake. Must be the first frame on a connection.
    #[serde(rename = "attach")]
    Attach {
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<String>,
        credential: String,
        cols: u16,
        rows: u16,
    },

    /// Terminal input.
    #[serde(rename = "data")]
    Data {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },

    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "attached")]
    Attached {
        #[serde(rename = "sessionId")]
        session_id: String,
        resumed: bool,
    },

    /// Buffered output, sent once right after `attached` on a resume.
    #[serde(rename = "replay")]
    Replay {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Live shell output.
    #[serde(rename = "data")]
    Data {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat,

    /// The session is gone for good. Distinct from a transport close.
    #[serde(rename = "ended")]
    Ended {
        reason: EndReason,
        #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    #[serde(rename = "error")]
    Error { code: ErrorCode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The shell process exited on its own.
    Exit,
    /// The session was torn down because of a server-side failure.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailed,
    SessionNotFound,
    SandboxUnavailable,
    InvalidHandshake,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::SandboxUnavailable => "sandbox_unavailable",
            ErrorCode::InvalidHandshake => "invalid_handshake",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("binary frames are not supported")]
    Binary,
    #[error("expected attach, got {0}")]
    UnexpectedFrame(&'static str),
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> String {
        // Serializing these enums cannot fail: every field is a string,
        // integer, bool or byte vector.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        ServerFrame::Data { data: bytes.into() }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fresh_attach() {
        let frame =
            ClientFrame::decode(r#"{"type":"attach","credential":"tok","cols":80,"rows":24}"#)
                .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Attach {
                session_id: None,
                credential: "tok".into(),
                cols: 80,
                rows: 24,
            }
        );
    }

    #[test]
    fn decodes_resume_attach() {
        let frame = ClientFrame::decode(
            r#"{"type":"attach","sessionId":"abc","credential":"tok","cols":120,"rows":40}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Attach { session_id, .. } => assert_eq!(session_id.as_deref(), Some("abc")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn data_payload_is_base64() {
        let encoded = ServerFrame::data(b"hi\r\n".to_vec()).encode();
        assert_eq!(encoded, r#"{"type":"data","data":"aGkNCg=="}"#);

        let decoded = ClientFrame::decode(r#"{"type":"data","data":"bHM="}"#).unwrap();
        assert_eq!(decoded, ClientFrame::Data { data: b"ls".to_vec() });
    }

    #[test]
    fn ended_omits_missing_exit_code() {
        let frame = ServerFrame::Ended {
            reason: EndReason::Error,
            exit_code: None,
        };
        assert_eq!(frame.encode(), r#"{"type":"ended","reason":"error"}"#);

        let frame = ServerFrame::Ended {
            reason: EndReason::Exit,
            exit_code: Some(0),
        };
        assert_eq!(frame.encode(), r#"{"type":"ended","reason":"exit","exitCode":0}"#);
    }

    #[test]
    fn error_codes_use_snake_case() {
        let frame = ServerFrame::Error {
            code: ErrorCode::SessionNotFound,
        };
        assert_eq!(frame.encode(), r#"{"type":"error","code":"session_not_found"}"#);
        assert_eq!(ErrorCode::AuthFailed.to_string(), "auth_failed");
    }

    #[test]
    fn rejects_unknown_and_invalid_frames() {
        assert!(ClientFrame::decode(r#"{"type":"bogus"}"#).is_err());
        assert!(ClientFrame::decode(r#"{"type":"data","data":"***"}"#).is_err());
        assert!(ClientFrame::decode("not json").is_err());
        // Server-only frames are not valid from a client.
        assert!(ClientFrame::decode(r#"{"type":"ended","reason":"exit"}"#).is_err());
    }
}
