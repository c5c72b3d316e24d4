//! Client reconnection state machine.
//!
//! Pure logic: feed it [`ClientEvent`]s, carry out the [`ClientAction`]s it
//! returns. The async driver does the I/O.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::policy::ReconnectPolicy;
use crate::protocol::{ClientFrame, EndReason, ErrorCode, ServerFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disconnected => "disconnected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Initial connect.
    Start,
    Frame(ServerFrame),
    /// The transport closed, failed to open, or went silent.
    TransportLost,
    /// The relay handed the session to another connection.
    Superseded,
    RetryTimerFired,
    /// Explicit user request for a new connection.
    UserReconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Open a transport and send this `attach` frame on it.
    Connect(ClientFrame),
    CloseTransport,
    ScheduleRetry { delay: Duration, attempt: u32 },
    /// Clear the terminal before a replay so nothing is shown twice.
    ResetTerminal,
    WriteTerminal(Vec<u8>),
    PersistSession(String),
    ClearSession,
    StatusChanged(ConnectionStatus),
    /// The session is over; only the user can start a new one.
    SessionEnded {
        reason: EndReason,
        exit_code: Option<i32>,
    },
    /// The relay refused us for a reason retrying cannot fix.
    Rejected(ErrorCode),
    /// Automatic retries are exhausted.
    GaveUp { attempts: u32 },
    /// Another client took the session; reconnecting would steal it back.
    Superseded,
}

pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    credential: String,
    cols: u16,
    rows: u16,
    status: ConnectionStatus,
    persisted_session_id: Option<String>,
    attempt: u32,
    manual_reconnect_pending: bool,
    /// A transport is open or being opened.
    transport_active: bool,
    /// Output from some session has been written to the terminal.
    terminal_dirty: bool,
}

impl ReconnectMachine {
    pub fn new(
        policy: ReconnectPolicy,
        credential: impl Into<String>,
        persisted_session_id: Option<String>,
    ) -> Self {
        Self {
            policy,
            credential: credential.into(),
            cols: 80,
            rows: 24,
            status: ConnectionStatus::Disconnected,
            persisted_session_id,
            attempt: 0,
            manual_reconnect_pending: false,
            transport_active: false,
            terminal_dirty: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.persisted_session_id.as_deref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn manual_reconnect_pending(&self) -> bool {
        self.manual_reconnect_pending
    }

    /// Terminal size sent with the next `attach`.
    pub fn set_size(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    pub fn handle(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        let mut actions = Vec::new();
        match event {
            ClientEvent::Start => {
                self.set_status(ConnectionStatus::Connecting, &mut actions);
                self.connect(&mut actions);
            }
            ClientEvent::Frame(frame) => self.on_frame(frame, &mut actions),
            ClientEvent::TransportLost => self.on_transport_lost(&mut actions),
            ClientEvent::Superseded => {
                if self.transport_active {
                    self.transport_active = false;
                    self.manual_reconnect_pending = true;
                    actions.push(ClientAction::Superseded);
                    self.set_status(ConnectionStatus::Disconnected, &mut actions);
                }
            }
            ClientEvent::RetryTimerFired => {
                if self.status == ConnectionStatus::Reconnecting && !self.transport_active {
                    self.connect(&mut actions);
                }
            }
            ClientEvent::UserReconnect => {
                if self.status != ConnectionStatus::Disconnected {
                    debug!("Ignoring reconnect request while {}", self.status);
                    return actions;
                }
                self.manual_reconnect_pending = false;
                self.attempt = 0;
                self.set_status(ConnectionStatus::Connecting, &mut actions);
                self.connect(&mut actions);
            }
        }
        actions
    }

    fn on_frame(&mut self, frame: ServerFrame, actions: &mut Vec<ClientAction>) {
        if !self.transport_active {
            debug!("Dropping frame from a closed transport");
            return;
        }
        match frame {
            ServerFrame::Attached {
                session_id,
                resumed,
            } => {
                info!(
                    "Attached to session {} (resumed: {}, attempt: {})",
                    session_id, resumed, self.attempt
                );
                if !resumed && self.terminal_dirty {
                    // A different shell now; the old screen is meaningless.
                    actions.push(ClientAction::ResetTerminal);
                }
                self.attempt = 0;
                self.persisted_session_id = Some(session_id.clone());
                actions.push(ClientAction::PersistSession(session_id));
                self.set_status(ConnectionStatus::Connected, actions);
            }
            ServerFrame::Replay { data } => {
                actions.push(ClientAction::ResetTerminal);
                if !data.is_empty() {
                    self.terminal_dirty = true;
                    actions.push(ClientAction::WriteTerminal(data));
                }
            }
            ServerFrame::Data { data } => {
                self.terminal_dirty = true;
                actions.push(ClientAction::WriteTerminal(data));
            }
            ServerFrame::Heartbeat => {}
            ServerFrame::Ended { reason, exit_code } => {
                info!("Session ended ({:?}, exit code: {:?})", reason, exit_code);
                self.persisted_session_id = None;
                self.manual_reconnect_pending = true;
                self.close_transport(actions);
                actions.push(ClientAction::ClearSession);
                actions.push(ClientAction::SessionEnded { reason, exit_code });
                self.set_status(ConnectionStatus::Disconnected, actions);
            }
            ServerFrame::Error { code } => self.on_error(code, actions),
        }
    }

    fn on_error(&mut self, code: ErrorCode, actions: &mut Vec<ClientAction>) {
        self.close_transport(actions);
        match code {
            ErrorCode::SessionNotFound => {
                info!("Session expired on the relay; requesting a new one");
                self.persisted_session_id = None;
                actions.push(ClientAction::ClearSession);
                self.connect(actions);
            }
            ErrorCode::SandboxUnavailable => {
                warn!("Relay could not create a sandbox; retrying");
                self.schedule_retry(actions);
            }
            ErrorCode::AuthFailed | ErrorCode::InvalidHandshake => {
                warn!("Relay rejected the connection: {}", code);
                self.manual_reconnect_pending = true;
                actions.push(ClientAction::Rejected(code));
                self.set_status(ConnectionStatus::Disconnected, actions);
            }
        }
    }

    fn on_transport_lost(&mut self, actions: &mut Vec<ClientAction>) {
        if !self.transport_active {
            return;
        }
        self.transport_active = false;
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        self.schedule_retry(actions);
    }

    fn schedule_retry(&mut self, actions: &mut Vec<ClientAction>) {
        self.attempt += 1;
        if self.policy.exhausted(self.attempt) {
            let attempts = self.attempt - 1;
            warn!("Giving up after {} reconnection attempts", attempts);
            self.manual_reconnect_pending = true;
            actions.push(ClientAction::GaveUp { attempts });
            self.set_status(ConnectionStatus::Disconnected, actions);
            return;
        }
        let delay = self.policy.delay(self.attempt);
        debug!("Reconnect attempt {} in {:?}", self.attempt, delay);
        self.set_status(ConnectionStatus::Reconnecting, actions);
        actions.push(ClientAction::ScheduleRetry {
            delay,
            attempt: self.attempt,
        });
    }

    fn connect(&mut self, actions: &mut Vec<ClientAction>) {
        self.transport_active = true;
        actions.push(ClientAction::Connect(ClientFrame::Attach {
            session_id: self.persisted_session_id.clone(),
            credential: self.credential.clone(),
            cols: self.cols,
            rows: self.rows,
        }));
    }

    fn close_transport(&mut self, actions: &mut Vec<ClientAction>) {
        if self.transport_active {
            self.transport_active = false;
            actions.push(ClientAction::CloseTransport);
        }
    }

    fn set_status(&mut self, status: ConnectionStatus, actions: &mut Vec<ClientAction>) {
        if self.status != status {
            self.status = status;
            actions.push(ClientAction::StatusChanged(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(0.0)
            .with_max_attempts(Some(3))
    }

    fn attach_of(actions: &[ClientAction]) -> Option<Option<String>> {
        actions.iter().find_map(|action| match action {
            ClientAction::Connect(ClientFrame::Attach { session_id, .. }) => {
                Some(session_id.clone())
            }
            _ => None,
        })
    }

    fn attached(machine: &mut ReconnectMachine, id: &str, resumed: bool) -> Vec<ClientAction> {
        machine.handle(ClientEvent::Frame(ServerFrame::Attached {
            session_id: id.to_string(),
            resumed,
        }))
    }

    #[test]
    fn initial_connect_requests_new_session() {
        let mut machine = ReconnectMachine::new(policy(), "tok", None);
        let actions = machine.handle(ClientEvent::Start);
        assert_eq!(attach_of(&actions), Some(None));
        assert_eq!(machine.status(), ConnectionStatus::Connecting);

        let actions = attached(&mut machine, "s1", false);
        assert!(actions.contains(&ClientAction::PersistSession("s1".into())));
        assert!(!actions.contains(&ClientAction::ResetTerminal));
        assert_eq!(machine.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn initial_connect_resumes_persisted_session() {
        let mut machine = ReconnectMachine::new(policy(), "tok", Some("s1".into()));
        let actions = machine.handle(ClientEvent::Start);
        assert_eq!(attach_of(&actions), Some(Some("s1".into())));

        attached(&mut machine, "s1", true);
        let actions = machine.handle(ClientEvent::Frame(ServerFrame::Replay {
            data: b"$ ".to_vec(),
        }));
        assert_eq!(
            actions,
            vec![
                ClientAction::ResetTerminal,
                ClientAction::WriteTerminal(b"$ ".to_vec())
            ]
        );
    }

    #[test]
    fn transport_loss_backs_off_then_resumes() {
        let mut machine = ReconnectMachine::new(policy(), "tok", None);
        machine.handle(ClientEvent::Start);
        attached(&mut machine, "s1", false);

        let actions = machine.handle(ClientEvent::TransportLost);
        assert!(actions.contains(&ClientAction::ScheduleRetry {
            delay: Duration::from_millis(100),
            attempt: 1
        }));
        assert_eq!(machine.status(), ConnectionStatus::Reconnecting);

        let actions = machine.handle(ClientEvent::RetryTimerFired);
        assert_eq!(attach_of(&actions), Some(Some("s1".into())));
        let actions = machine.handle(ClientEvent::TransportLost);
        assert!(actions.contains(&ClientAction::ScheduleRetry {
            delay: Duration::from_millis(200),
            attempt: 2
        }));

        machine.handle(ClientEvent::RetryTimerFired);
        attached(&mut machine, "s1", true);
        assert_eq!(machine.attempt(), 0);
        assert_eq!(machine.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn ended_clears_session_and_waits_for_user() {
        let mut machine = ReconnectMachine::new(policy(), "tok", None);
        machine.handle(ClientEvent::Start);
        attached(&mut machine, "s1", false);

        let actions = machine.handle(ClientEvent::Frame(ServerFrame::Ended {
            reason: EndReason::Exit,
            exit_code: Some(0),
        }));
        assert!(actions.contains(&ClientAction::ClearSession));
        assert!(actions.contains(&ClientAction::CloseTransport));
        assert!(actions.contains(&ClientAction::SessionEnded {
            reason: EndReason::Exit,
            exit_code: Some(0)
        }));
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
        assert!(machine.manual_reconnect_pending());
        assert_eq!(machine.session_id(), None);

        // The socket closing afterwards must not trigger a retry.
        assert!(machine.handle(ClientEvent::TransportLost).is_empty());
        assert!(machine.handle(ClientEvent::RetryTimerFired).is_empty());

        let actions = machine.handle(ClientEvent::UserReconnect);
        assert_eq!(attach_of(&actions), Some(None));
        assert!(!machine.manual_reconnect_pending());
    }

    #[test]
    fn session_not_found_falls_back_to_new_session() {
        let mut machine = ReconnectMachine::new(policy(), "tok", Some("gone".into()));
        machine.handle(ClientEvent::Start);
        let actions = machine.handle(ClientEvent::Frame(ServerFrame::Error {
            code: ErrorCode::SessionNotFound,
        }));
        assert!(actions.contains(&ClientAction::CloseTransport));
        assert!(actions.contains(&ClientAction::ClearSession));
        assert_eq!(attach_of(&actions), Some(None));
        assert_eq!(machine.session_id(), None);
        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn superseded_keeps_session_but_stops_retrying() {
        let mut machine = ReconnectMachine::new(policy(), "tok", None);
        machine.handle(ClientEvent::Start);
        attached(&mut machine, "s1", false);

        let actions = machine.handle(ClientEvent::Superseded);
        assert!(actions.contains(&ClientAction::Superseded));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ClientAction::ScheduleRetry { .. })));
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
        assert_eq!(machine.session_id(), Some("s1"));

        let actions = machine.handle(ClientEvent::UserReconnect);
        assert_eq!(attach_of(&actions), Some(Some("s1".into())));
    }

    #[test]
    fn auth_failure_is_terminal() {
        let mut machine = ReconnectMachine::new(policy(), "bad", None);
        machine.handle(ClientEvent::Start);
        let actions = machine.handle(ClientEvent::Frame(ServerFrame::Error {
            code: ErrorCode::AuthFailed,
        }));
        assert!(actions.contains(&ClientAction::Rejected(ErrorCode::AuthFailed)));
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
        assert!(machine.handle(ClientEvent::TransportLost).is_empty());
    }

    #[test]
    fn sandbox_unavailable_retries_with_backoff() {
        let mut machine = ReconnectMachine::new(policy(), "tok", None);
        machine.handle(ClientEvent::Start);
        let actions = machine.handle(ClientEvent::Frame(ServerFrame::Error {
            code: ErrorCode::SandboxUnavailable,
        }));
        assert!(actions.contains(&ClientAction::ScheduleRetry {
            delay: Duration::from_millis(100),
            attempt: 1
        }));
        assert_eq!(machine.status(), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn exhausted_retries_need_manual_reconnect() {
        let mut machine = ReconnectMachine::new(policy(), "tok", None);
        machine.handle(ClientEvent::Start);
        for _ in 0..3 {
            machine.handle(ClientEvent::TransportLost);
            machine.handle(ClientEvent::RetryTimerFired);
        }
        let actions = machine.handle(ClientEvent::TransportLost);
        assert!(actions.contains(&ClientAction::GaveUp { attempts: 3 }));
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
        assert!(machine.manual_reconnect_pending());
    }

    #[test]
    fn fresh_session_after_output_resets_terminal() {
        let mut machine = ReconnectMachine::new(policy(), "tok", Some("old".into()));
        machine.handle(ClientEvent::Start);
        attached(&mut machine, "old", true);
        machine.handle(ClientEvent::Frame(ServerFrame::data(b"x".to_vec())));
        machine.handle(ClientEvent::TransportLost);
        machine.handle(ClientEvent::RetryTimerFired);
        machine.handle(ClientEvent::Frame(ServerFrame::Error {
            code: ErrorCode::SessionNotFound,
        }));
        let actions = attached(&mut machine, "new", false);
        assert!(actions.contains(&ClientAction::ResetTerminal));
        assert_eq!(machine.session_id(), Some("new"));
    }
}
