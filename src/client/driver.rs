//! Async side of the client: runs a [`ReconnectMachine`] against a real
//! WebSocket and a terminal.

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::machine::{ClientAction, ClientEvent, ConnectionStatus, ReconnectMachine};
use super::policy::{ReconnectPolicy, MAX_RETRY_DELAY};
use super::store::SessionStore;
use crate::errors::{ClientError, ClientResult};
use crate::protocol::{ClientFrame, EndReason, ErrorCode, ServerFrame};
use crate::relay::CLOSE_SUPERSEDED;

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where session output goes.
pub trait TerminalSink: Send {
    /// Clear the screen and reset terminal modes.
    fn reset(&mut self) -> std::io::Result<()>;
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    fn status(&mut self, _status: ConnectionStatus) {}
    /// Out-of-band message for the user (retry countdowns, end of session).
    fn notice(&mut self, _message: &str) {}
}

/// Input from the user side of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    /// Reconnect now: skips a pending backoff, or starts a new session
    /// after the previous one ended.
    Reconnect,
    Quit,
}

/// Why [`ClientDriver::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    /// The user quit while the session was still alive.
    Detached,
    Ended {
        reason: EndReason,
        exit_code: Option<i32>,
    },
    Rejected(ErrorCode),
    GaveUp { attempts: u32 },
    /// Another client attached to the session.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// No frame from the relay for this long counts as transport loss.
    pub heartbeat_timeout: Duration,
    /// Return as soon as the machine is disconnected instead of waiting for
    /// [`DriverInput::Reconnect`].
    pub exit_on_disconnect: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            exit_on_disconnect: false,
        }
    }
}

pub struct ClientDriver<S: TerminalSink> {
    url: Url,
    config: DriverConfig,
    machine: ReconnectMachine,
    store: Box<dyn SessionStore>,
    sink: S,
    transport: Option<Transport>,
    retry_at: Option<Instant>,
    last_seen: Instant,
    outcome: Option<DriverOutcome>,
}

impl<S: TerminalSink> ClientDriver<S> {
    pub fn new(
        url: &str,
        credential: impl Into<String>,
        policy: ReconnectPolicy,
        store: Box<dyn SessionStore>,
        sink: S,
    ) -> ClientResult<Self> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
        }
        let persisted = store.load()?;
        if let Some(id) = &persisted {
            debug!("Found persisted session {}", id);
        }
        Ok(Self {
            url,
            config: DriverConfig::default(),
            machine: ReconnectMachine::new(policy, credential, persisted),
            store,
            sink,
            transport: None,
            retry_at: None,
            last_seen: Instant::now(),
            outcome: None,
        })
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.machine.set_size(cols, rows);
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn status(&self) -> ConnectionStatus {
        self.machine.status()
    }

    /// Drive the connection until the user quits, the input channel closes,
    /// or (with `exit_on_disconnect`) the machine gives up.
    pub async fn run(
        &mut self,
        input: &mut mpsc::UnboundedReceiver<DriverInput>,
    ) -> ClientResult<DriverOutcome> {
        let mut pending: VecDeque<ClientAction> =
            self.machine.handle(ClientEvent::Start).into();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            while let Some(action) = pending.pop_front() {
                self.apply(action, &mut pending).await?;
            }
            if self.config.exit_on_disconnect
                && self.machine.status() == ConnectionStatus::Disconnected
            {
                return Ok(self.outcome.take().unwrap_or(DriverOutcome::Detached));
            }

            tokio::select! {
                message = next_message(&mut self.transport) => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.last_seen = Instant::now();
                            match ServerFrame::decode(&text) {
                                Ok(frame) => pending.extend(self.machine.handle(ClientEvent::Frame(frame))),
                                Err(e) => warn!("Ignoring frame from relay: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Relay closed the connection: {:?}", frame);
                            let superseded = frame
                                .as_ref()
                                .is_some_and(|f| u16::from(f.code) == CLOSE_SUPERSEDED);
                            self.transport = None;
                            let event = if superseded {
                                ClientEvent::Superseded
                            } else {
                                ClientEvent::TransportLost
                            };
                            pending.extend(self.machine.handle(event));
                        }
                        Some(Ok(_)) => self.last_seen = Instant::now(),
                        Some(Err(e)) => {
                            debug!("Transport error: {}", e);
                            self.lose_transport(&mut pending);
                        }
                        None => self.lose_transport(&mut pending),
                    }
                }
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    pending.extend(self.machine.handle(ClientEvent::RetryTimerFired));
                }
                input = input.recv() => match input {
                    Some(DriverInput::Data(bytes)) => {
                        if self.machine.status() == ConnectionStatus::Connected {
                            self.send(&ClientFrame::Data { data: bytes }, &mut pending).await;
                        }
                    }
                    Some(DriverInput::Resize { cols, rows }) => {
                        self.machine.set_size(cols, rows);
                        if self.machine.status() == ConnectionStatus::Connected {
                            self.send(&ClientFrame::Resize { cols, rows }, &mut pending).await;
                        }
                    }
                    Some(DriverInput::Reconnect) => match self.machine.status() {
                        ConnectionStatus::Disconnected => {
                            self.outcome = None;
                            pending.extend(self.machine.handle(ClientEvent::UserReconnect));
                        }
                        ConnectionStatus::Reconnecting if self.retry_at.is_some() => {
                            self.retry_at = None;
                            pending.extend(self.machine.handle(ClientEvent::RetryTimerFired));
                        }
                        status => debug!("Reconnect ignored while {}", status),
                    },
                    Some(DriverInput::Quit) | None => {
                        self.close_transport().await;
                        return Ok(self.outcome.take().unwrap_or(DriverOutcome::Detached));
                    }
                },
                _ = heartbeat.tick() => {
                    if self.transport.is_some() {
                        if self.last_seen.elapsed() > self.config.heartbeat_timeout {
                            info!("No frames from relay for {:?}", self.last_seen.elapsed());
                            self.lose_transport(&mut pending);
                        } else {
                            self.send(&ClientFrame::Heartbeat, &mut pending).await;
                        }
                    }
                }
            }
        }
    }

    async fn apply(
        &mut self,
        action: ClientAction,
        pending: &mut VecDeque<ClientAction>,
    ) -> ClientResult<()> {
        match action {
            ClientAction::Connect(attach) => match self.open(&attach).await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.last_seen = Instant::now();
                }
                Err(e) => {
                    debug!("Connecting to {} failed: {}", self.url, e);
                    self.lose_transport(pending);
                }
            },
            ClientAction::CloseTransport => self.close_transport().await,
            ClientAction::ScheduleRetry { delay, attempt } => {
                let now = Instant::now();
                self.retry_at = Some(now.checked_add(delay).unwrap_or(now + MAX_RETRY_DELAY));
                self.sink.notice(&format!(
                    "Reconnecting in {:.1}s (attempt {})",
                    delay.as_secs_f64(),
                    attempt
                ));
            }
            ClientAction::ResetTerminal => self.sink.reset()?,
            ClientAction::WriteTerminal(bytes) => self.sink.write(&bytes)?,
            ClientAction::PersistSession(id) => {
                if let Err(e) = self.store.save(&id) {
                    warn!("Failed to persist session id: {}", e);
                }
            }
            ClientAction::ClearSession => {
                if let Err(e) = self.store.clear() {
                    warn!("Failed to clear persisted session id: {}", e);
                }
            }
            ClientAction::StatusChanged(status) => self.sink.status(status),
            ClientAction::SessionEnded { reason, exit_code } => {
                let message = match (reason, exit_code) {
                    (EndReason::Exit, Some(code)) => format!("Session ended (exit code {})", code),
                    (EndReason::Exit, None) => "Session ended".to_string(),
                    (EndReason::Error, _) => "Session ended by the relay".to_string(),
                };
                self.sink.notice(&message);
                self.outcome = Some(DriverOutcome::Ended { reason, exit_code });
            }
            ClientAction::Rejected(code) => {
                self.sink.notice(&format!("Relay refused the connection: {}", code));
                self.outcome = Some(DriverOutcome::Rejected(code));
            }
            ClientAction::Superseded => {
                self.sink
                    .notice("Session taken over by another client");
                self.outcome = Some(DriverOutcome::Superseded);
            }
            ClientAction::GaveUp { attempts } => {
                self.sink
                    .notice(&format!("Gave up after {} attempts", attempts));
                self.outcome = Some(DriverOutcome::GaveUp { attempts });
            }
        }
        Ok(())
    }

    async fn open(&self, attach: &ClientFrame) -> ClientResult<Transport> {
        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (mut transport, _) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })??;
        transport.send(Message::Text(attach.encode())).await?;
        Ok(transport)
    }

    async fn send(&mut self, frame: &ClientFrame, pending: &mut VecDeque<ClientAction>) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.send(Message::Text(frame.encode())).await {
            debug!("Send failed: {}", e);
            self.lose_transport(pending);
        }
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close(None).await;
        }
    }

    fn lose_transport(&mut self, pending: &mut VecDeque<ClientAction>) {
        self.transport = None;
        pending.extend(self.machine.handle(ClientEvent::TransportLost));
    }
}

async fn next_message(
    transport: &mut Option<Transport>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match transport {
        Some(transport) => transport.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
