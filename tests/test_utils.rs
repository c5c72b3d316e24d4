//! Test utilities for relay e2e tests.
//!
//! Starts a relay on an ephemeral port with the host runtime and `/bin/sh`,
//! and provides a thin raw WebSocket client.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use cmux_relay::protocol::{ClientFrame, ServerFrame};
use cmux_relay::pty::ShellConfig;
use cmux_relay::relay::{Authenticator, CredentialPolicy, RelayConfig, RelayServer};
use cmux_relay::sandbox::{HostRuntime, SandboxSupervisor, SupervisorConfig};
use cmux_relay::session::{SessionConfig, SessionInfo, SessionRegistry};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestRelay {
    pub url: String,
    pub http_url: String,
    pub registry: Arc<SessionRegistry>,
    pub supervisor: Arc<SandboxSupervisor>,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

pub struct RelayOptions {
    pub policy: CredentialPolicy,
    pub grace_period: Duration,
    pub banner: Option<String>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            policy: CredentialPolicy::Disabled,
            grace_period: Duration::from_secs(30),
            banner: None,
        }
    }
}

impl TestRelay {
    pub async fn start(options: RelayOptions) -> anyhow::Result<Self> {
        let supervisor = Arc::new(SandboxSupervisor::new(
            Arc::new(HostRuntime::default()),
            SupervisorConfig {
                stop_grace: Duration::from_millis(200),
                ..SupervisorConfig::default()
            },
        ));
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&supervisor),
            SessionConfig {
                grace_period: options.grace_period,
                buffer_capacity: 64 * 1024,
                shell: ShellConfig::new("/bin/sh"),
                banner: options.banner,
            },
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = RelayServer::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            Authenticator::new(options.policy),
            RelayConfig {
                bind_addr: addr,
                handshake_timeout: Duration::from_secs(2),
                ..RelayConfig::default()
            },
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(listener, shutdown.clone()));

        Ok(Self {
            url: format!("ws://{}/ws", addr),
            http_url: format!("http://{}", addr),
            registry,
            supervisor,
            shutdown,
            task,
        })
    }

    pub async fn sessions(&self) -> anyhow::Result<Vec<SessionInfo>> {
        let sessions = self
            .sessions_as(None)
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(sessions)
    }

    /// `GET /sessions`, optionally with a bearer credential.
    pub async fn sessions_as(&self, credential: Option<&str>) -> anyhow::Result<reqwest::Response> {
        let mut request = reqwest::Client::new().get(format!("{}/sessions", self.http_url));
        if let Some(credential) = credential {
            request = request.bearer_auth(credential);
        }
        Ok(request.send().await?)
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task).await???;
        Ok(())
    }
}

pub async fn connect(url: &str) -> anyhow::Result<Ws> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws)
}

pub async fn send(ws: &mut Ws, frame: &ClientFrame) -> anyhow::Result<()> {
    ws.send(Message::Text(frame.encode())).await?;
    Ok(())
}

pub async fn attach(
    url: &str,
    session_id: Option<&str>,
    credential: &str,
) -> anyhow::Result<Ws> {
    let mut ws = connect(url).await?;
    send(
        &mut ws,
        &ClientFrame::Attach {
            session_id: session_id.map(str::to_string),
            credential: credential.to_string(),
            cols: 80,
            rows: 24,
        },
    )
    .await?;
    Ok(ws)
}

pub async fn type_line(ws: &mut Ws, line: &str) -> anyhow::Result<()> {
    send(
        ws,
        &ClientFrame::Data {
            data: format!("{}\n", line).into_bytes(),
        },
    )
    .await
}

/// What the relay sent next, skipping heartbeats and pings.
#[derive(Debug)]
pub enum Received {
    Frame(ServerFrame),
    Closed(Option<CloseFrame<'static>>),
}

pub async fn recv(ws: &mut Ws) -> anyhow::Result<Received> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for the relay"))?;
        match message {
            Some(Ok(Message::Text(text))) => match ServerFrame::decode(&text)? {
                ServerFrame::Heartbeat => continue,
                frame => return Ok(Received::Frame(frame)),
            },
            Some(Ok(Message::Close(frame))) => return Ok(Received::Closed(frame)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return Ok(Received::Closed(None)),
        }
    }
}

pub async fn recv_frame(ws: &mut Ws) -> anyhow::Result<ServerFrame> {
    match recv(ws).await? {
        Received::Frame(frame) => Ok(frame),
        Received::Closed(frame) => anyhow::bail!("connection closed: {:?}", frame),
    }
}

/// Read output (replay and data frames) until `needle` appears. Returns
/// everything collected.
pub async fn output_until(ws: &mut Ws, needle: &str) -> anyhow::Result<String> {
    let mut collected = Vec::new();
    while !String::from_utf8_lossy(&collected).contains(needle) {
        match recv_frame(ws).await? {
            ServerFrame::Data { data } | ServerFrame::Replay { data } => collected.extend(data),
            other => anyhow::bail!("unexpected frame {:?}", other),
        }
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

pub async fn attached_id(ws: &mut Ws) -> anyhow::Result<(String, bool)> {
    match recv_frame(ws).await? {
        ServerFrame::Attached {
            session_id,
            resumed,
        } => Ok((session_id, resumed)),
        other => anyhow::bail!("expected attached, got {:?}", other),
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    exp: i64,
}

/// An HS256 client token for `client_id`, valid for an hour.
pub fn client_token(secret: &str, client_id: &str) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        &Claims {
            sub: client_id,
            exp: chrono::Utc::now().timestamp() + 3600,
        },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("sign client token")
}

/// Poll `condition` until it holds or ten seconds pass.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
