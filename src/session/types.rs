use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::state::SessionState;
use crate::protocol::ServerFrame;
use crate::pty::ShellConfig;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session survives without an attached connection.
    pub grace_period: Duration,
    /// Size of the replay buffer in bytes.
    pub buffer_capacity: usize,
    pub shell: ShellConfig,
    /// Written into the output buffer once, when the session is created.
    pub banner: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            buffer_capacity: 256 * 1024,
            shell: ShellConfig::default(),
            banner: None,
        }
    }
}

/// What the registry pushes to an attached connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(ServerFrame),
    /// Another connection attached to the same session.
    Evicted,
}

/// The live sink of a session: one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub conn_id: Uuid,
    pub tx: UnboundedSender<Outbound>,
}

impl Attachment {
    pub fn new(conn_id: Uuid, tx: UnboundedSender<Outbound>) -> Self {
        Self { conn_id, tx }
    }
}

/// Point-in-time view of a session, as served by `GET /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    /// Client that created the session, when credentials name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub state: SessionState,
    pub sandbox_id: String,
    pub attached: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub buffered_bytes: usize,
    pub total_output: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_remaining_ms: Option<u64>,
}
