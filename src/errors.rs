use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorCode;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The runtime failed its health check or its binaries are missing.
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox resources exhausted: {0}")]
    ResourcesExhausted(String),
    #[error("sandbox creation timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to launch sandbox: {0}")]
    Launch(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum PtyAttachError {
    #[error("sandbox {0} is not ready")]
    SandboxNotReady(String),
    #[error("failed to open pty: {0}")]
    Open(String),
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
}

/// Errors from session creation. Resume misses are not errors; see
/// [`crate::session::SessionRegistry::resume_session`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session creation failed: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("session creation failed: {0}")]
    Pty(#[from] PtyAttachError),
}

impl SessionError {
    /// Wire code reported to the client. Every creation failure is retriable
    /// from the client's point of view.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::SandboxUnavailable
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported relay url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] crate::protocol::ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;
