//! One WebSocket connection: handshake, then pumping frames between the
//! socket and the attached session.

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::server::RelayState;
use crate::protocol::{ClientFrame, ErrorCode, ProtocolError, ServerFrame};
use crate::sandbox::SandboxCredentials;
use crate::session::{Attachment, Outbound, SessionHandle};

/// Application close code sent to a connection replaced by a newer one.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Per-connection bookkeeping. Lives as long as the transport.
pub struct Connection {
    pub id: Uuid,
    pub credential: String,
    pub attached_session_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            credential: String::new(),
            attached_session_id: None,
            connected_at: Utc::now(),
        }
    }
}

struct Handshake {
    session_id: Option<String>,
    credential: String,
    cols: u16,
    rows: u16,
}

/// How the outbound writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterExit {
    /// The session ended; `ended` was delivered and the socket closed.
    Ended,
    /// Another connection took over the session.
    Superseded,
    /// Either side of the writer went away.
    Closed,
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: RelayState) {
    let mut conn = Connection::new();
    let (mut ws_write, mut ws_read) = socket.split();
    debug!("[ws:{}] Connection opened", conn.id);

    let handshake = match tokio::time::timeout(
        state.config.handshake_timeout,
        read_handshake(&mut ws_read),
    )
    .await
    {
        Ok(Ok(Some(handshake))) => handshake,
        Ok(Ok(None)) => {
            debug!("[ws:{}] Closed before handshake", conn.id);
            return;
        }
        Ok(Err(e)) => {
            warn!("[ws:{}] Invalid handshake: {}", conn.id, e);
            reject(&mut ws_write, ErrorCode::InvalidHandshake).await;
            return;
        }
        Err(_) => {
            warn!(
                "[ws:{}] No handshake within {:?}",
                conn.id, state.config.handshake_timeout
            );
            reject(&mut ws_write, ErrorCode::InvalidHandshake).await;
            return;
        }
    };
    conn.credential = handshake.credential.clone();

    let identity = match state.authenticator.authenticate(&conn.credential) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("[ws:{}] Authentication failed: {}", conn.id, e);
            reject(&mut ws_write, ErrorCode::AuthFailed).await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let attachment = Attachment::new(conn.id, outbound_tx);

    let session = match handshake.session_id {
        Some(session_id) => match state.registry.resume_session(
            &session_id,
            identity.client_id.as_deref(),
            attachment,
        ) {
            Some(session) => session,
            None => {
                info!("[ws:{}] Session {} not found", conn.id, session_id);
                reject(&mut ws_write, ErrorCode::SessionNotFound).await;
                return;
            }
        },
        None => {
            let credentials = SandboxCredentials {
                credential: conn.credential.clone(),
                client_id: identity.client_id.clone(),
            };
            let created = state
                .registry
                .create_session(&credentials, handshake.cols, handshake.rows)
                .await;
            let attached = match created {
                Ok(session_id) => state.registry.attach(
                    &session_id,
                    identity.client_id.as_deref(),
                    attachment,
                    false,
                ),
                Err(e) => {
                    error!("[ws:{}] {}", conn.id, e);
                    reject(&mut ws_write, e.code()).await;
                    return;
                }
            };
            match attached {
                Some(session) => session,
                // The shell died before anyone could attach.
                None => {
                    reject(&mut ws_write, ErrorCode::SandboxUnavailable).await;
                    return;
                }
            }
        }
    };
    session.resize(handshake.cols, handshake.rows);
    conn.attached_session_id = Some(session.id().to_string());
    info!(
        "[ws:{}] Attached to session {} (client: {:?})",
        conn.id,
        session.id(),
        identity.client_id
    );

    let (control_tx, control_rx) = mpsc::unbounded_channel::<Message>();
    let mut writer = tokio::spawn(write_loop(ws_write, outbound_rx, control_rx));

    let exit = read_loop(&state, &conn, &session, &mut ws_read, &control_tx, &mut writer).await;

    // Stale detaches (superseded connections) are ignored by the registry;
    // after `ended` the session is already gone.
    state.registry.detach_session(session.id(), conn.id);
    drop(control_tx);

    let exit = match exit {
        Some(exit) => exit,
        None => match tokio::time::timeout(std::time::Duration::from_secs(5), &mut writer).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                error!("[ws:{}] Writer task failed: {}", conn.id, e);
                WriterExit::Closed
            }
            Err(_) => {
                writer.abort();
                WriterExit::Closed
            }
        },
    };

    info!(
        "[ws:{}] Connection closed ({:?}, session: {}, connected for {}s)",
        conn.id,
        exit,
        session.id(),
        (Utc::now() - conn.connected_at).num_seconds()
    );
}

/// Wait for the `attach` frame. `Ok(None)` means the peer went away first.
async fn read_handshake(ws_read: &mut WsStream) -> Result<Option<Handshake>, ProtocolError> {
    while let Some(message) = ws_read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                return match ClientFrame::decode(&text)? {
                    ClientFrame::Attach {
                        session_id,
                        credential,
                        cols,
                        rows,
                    } => Ok(Some(Handshake {
                        session_id,
                        credential,
                        cols,
                        rows,
                    })),
                    other => Err(ProtocolError::UnexpectedFrame(frame_name(&other))),
                };
            }
            Ok(Message::Binary(_)) => return Err(ProtocolError::Binary),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return Ok(None),
            Err(e) => {
                debug!("WebSocket error during handshake: {}", e);
                return Ok(None);
            }
        }
    }
    Ok(None)
}

async fn read_loop(
    state: &RelayState,
    conn: &Connection,
    session: &SessionHandle,
    ws_read: &mut WsStream,
    control_tx: &mpsc::UnboundedSender<Message>,
    writer: &mut tokio::task::JoinHandle<WriterExit>,
) -> Option<WriterExit> {
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            message = ws_read.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("[ws:{}] Transport error: {}", conn.id, e);
                        return None;
                    }
                    None => return None,
                };
                last_seen = Instant::now();
                match message {
                    Message::Text(text) => match ClientFrame::decode(&text) {
                        Ok(ClientFrame::Data { data }) => {
                            if !session.write(&data) {
                                debug!("[ws:{}] Input after losing the session", conn.id);
                            }
                        }
                        Ok(ClientFrame::Resize { cols, rows }) => {
                            session.resize(cols, rows);
                        }
                        Ok(ClientFrame::Heartbeat) => session.touch(),
                        Ok(ClientFrame::Attach { .. }) => {
                            warn!("[ws:{}] Ignoring repeated attach", conn.id);
                        }
                        Err(e) => warn!("[ws:{}] {}", conn.id, e),
                    },
                    Message::Binary(_) => warn!("[ws:{}] {}", conn.id, ProtocolError::Binary),
                    Message::Ping(payload) => {
                        let _ = control_tx.send(Message::Pong(payload));
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => return None,
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > state.config.heartbeat_timeout {
                    info!(
                        "[ws:{}] Heartbeat timeout after {:?}",
                        conn.id,
                        last_seen.elapsed()
                    );
                    return None;
                }
                let _ = control_tx.send(Message::Text(ServerFrame::Heartbeat.encode().into()));
            }
            exit = &mut *writer => {
                return Some(match exit {
                    Ok(exit) => exit,
                    Err(e) => {
                        error!("[ws:{}] Writer task failed: {}", conn.id, e);
                        WriterExit::Closed
                    }
                });
            }
        }
    }
}

/// Owns the socket's write half. Session frames come from the registry;
/// heartbeats and pongs come from the read loop.
async fn write_loop(
    mut ws_write: WsSink,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut control_rx: mpsc::UnboundedReceiver<Message>,
) -> WriterExit {
    loop {
        tokio::select! {
            biased;
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    let ended = matches!(frame, ServerFrame::Ended { .. });
                    if ws_write.send(Message::Text(frame.encode().into())).await.is_err() {
                        return WriterExit::Closed;
                    }
                    if ended {
                        close(&mut ws_write, 1000, "ended").await;
                        return WriterExit::Ended;
                    }
                }
                Some(Outbound::Evicted) => {
                    close(&mut ws_write, CLOSE_SUPERSEDED, "superseded").await;
                    return WriterExit::Superseded;
                }
                None => {
                    close(&mut ws_write, 1000, "").await;
                    return WriterExit::Closed;
                }
            },
            control = control_rx.recv() => match control {
                Some(message) => {
                    if ws_write.send(message).await.is_err() {
                        return WriterExit::Closed;
                    }
                }
                None => {
                    close(&mut ws_write, 1000, "").await;
                    return WriterExit::Closed;
                }
            },
        }
    }
}

/// Send `error{code}` and close. Used for every handshake failure.
async fn reject(ws_write: &mut WsSink, code: ErrorCode) {
    let frame = ServerFrame::Error { code };
    if ws_write
        .send(Message::Text(frame.encode().into()))
        .await
        .is_ok()
    {
        close(ws_write, 1008, code.as_str()).await;
    }
}

async fn close(ws_write: &mut WsSink, code: u16, reason: &'static str) {
    let _ = ws_write
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
    let _ = ws_write.close().await;
}

fn frame_name(frame: &ClientFrame) -> &'static str {
    match frame {
        ClientFrame::Attach { .. } => "attach",
        ClientFrame::Data { .. } => "data",
        ClientFrame::Resize { .. } => "resize",
        ClientFrame::Heartbeat => "heartbeat",
    }
}
