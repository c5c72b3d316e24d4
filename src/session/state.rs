use serde::{Deserialize, Serialize};

/// Lifecycle of a session.
///
/// ```text
/// starting -> active <-> disconnected-grace
///                |              |
///                +--> closing <-+--> closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Starting,
    Active,
    DisconnectedGrace,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Active)
                | (Starting, DisconnectedGrace)
                | (Starting, Closing)
                | (Active, Active)
                | (Active, DisconnectedGrace)
                | (Active, Closing)
                | (DisconnectedGrace, Active)
                | (DisconnectedGrace, Closing)
                | (Closing, Closed)
        )
    }

    /// Whether a connection may attach to a session in this state.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Active | SessionState::DisconnectedGrace
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::DisconnectedGrace => "disconnected-grace",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
