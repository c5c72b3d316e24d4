//! Subcommands of the `cmux-relay` binary.
//!
//! `serve` runs the relay, `attach` is an interactive terminal client with
//! automatic reconnection, `sessions` lists what a running relay holds.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::ExecutableCommand;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cmux_relay::client::{
    ClientDriver, ConnectionStatus, DriverInput, DriverOutcome, FileSessionStore, ReconnectPolicy,
    SessionStore, TerminalSink,
};
use cmux_relay::pty::ShellConfig;
use cmux_relay::relay::{Authenticator, CredentialPolicy, RelayConfig, RelayServer};
use cmux_relay::sandbox::{
    BubblewrapRuntime, HostRuntime, ResourceLimits, SandboxRuntime, SandboxSupervisor,
    SupervisorConfig,
};
use cmux_relay::session::{SessionConfig, SessionInfo, SessionRegistry};

/// Ctrl+B, the prefix for client commands.
const PREFIX_KEY: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RuntimeKind {
    /// Shells run directly on the host. Development only.
    Host,
    /// Each session gets its own bubblewrap namespace sandbox.
    Bubblewrap,
}

pub struct ServeOptions {
    pub bind: SocketAddr,
    pub runtime: RuntimeKind,
    pub workspace_root: PathBuf,
    pub auth: CredentialPolicy,
    pub grace_period: Duration,
    pub buffer_capacity: usize,
    pub banner: Option<String>,
    pub shell: Option<String>,
    pub max_sandboxes: usize,
    pub creation_timeout: Duration,
    pub heartbeat_interval: Duration,
}

pub async fn cmd_serve(options: ServeOptions) -> Result<()> {
    let runtime: Arc<dyn SandboxRuntime> = match options.runtime {
        RuntimeKind::Host => {
            warn!("Running shells on the host without isolation");
            tokio::fs::create_dir_all(&options.workspace_root)
                .await
                .with_context(|| {
                    format!("failed to create {}", options.workspace_root.display())
                })?;
            Arc::new(HostRuntime::new(options.workspace_root.clone()))
        }
        RuntimeKind::Bubblewrap => Arc::new(
            BubblewrapRuntime::new(options.workspace_root.clone(), ResourceLimits::default())
                .await
                .context("bubblewrap runtime unavailable")?,
        ),
    };

    let supervisor = Arc::new(SandboxSupervisor::new(
        runtime,
        SupervisorConfig {
            creation_timeout: options.creation_timeout,
            max_sandboxes: options.max_sandboxes,
            ..SupervisorConfig::default()
        },
    ));

    let shell = match options.shell {
        Some(shell) => ShellConfig::new(shell),
        None => ShellConfig::default(),
    };
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&supervisor),
        SessionConfig {
            grace_period: options.grace_period,
            buffer_capacity: options.buffer_capacity,
            shell,
            banner: options.banner,
        },
    ));

    let heartbeat_interval = options.heartbeat_interval;
    let config = RelayConfig {
        bind_addr: options.bind,
        heartbeat_interval,
        heartbeat_timeout: heartbeat_interval * 3,
        ..RelayConfig::default()
    };

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let server = RelayServer::new(
        registry,
        supervisor,
        Authenticator::new(options.auth),
        config,
    );
    server.serve(listener, shutdown).await?;
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}

pub struct AttachOptions {
    pub url: String,
    pub credential: String,
    /// Key for the persisted session id; defaults to the URL.
    pub scope: Option<String>,
    pub policy: ReconnectPolicy,
    /// Forget any persisted session and start a new one.
    pub fresh: bool,
}

pub async fn cmd_attach(options: AttachOptions) -> Result<()> {
    let store = FileSessionStore::for_scope(options.scope.as_deref().unwrap_or(&options.url));
    if options.fresh {
        store.clear()?;
    }

    let (cols, rows) = terminal::size().unwrap_or((80, 24));
    let mut driver = ClientDriver::new(
        &options.url,
        options.credential,
        options.policy,
        Box::new(store),
        StdoutSink::default(),
    )?
    .with_size(cols, rows);

    eprintln!("Connecting to {}...", options.url);
    eprintln!("Press Ctrl+B then D to detach, Ctrl+B then R to reconnect");

    let guard = RawTerminal::enter()?;
    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    let input_task = tokio::spawn(forward_input(input_tx));

    let outcome = driver.run(&mut input_rx).await;

    input_task.abort();
    drop(guard);

    match outcome? {
        DriverOutcome::Detached => {
            eprintln!("Detached; the session keeps running until its grace period ends")
        }
        DriverOutcome::Ended { exit_code, .. } => match exit_code {
            Some(code) => eprintln!("Session ended (exit code {})", code),
            None => eprintln!("Session ended"),
        },
        DriverOutcome::Rejected(code) => anyhow::bail!("relay refused the connection: {}", code),
        DriverOutcome::GaveUp { attempts } => {
            anyhow::bail!("could not reach the relay after {} attempts", attempts)
        }
        DriverOutcome::Superseded => eprintln!("Session taken over by another client"),
    }
    Ok(())
}

/// Read terminal events and turn them into driver input.
async fn forward_input(tx: mpsc::UnboundedSender<DriverInput>) {
    let mut events = EventStream::new();
    let mut prefix = false;

    while let Some(event) = events.next().await {
        let input = match event {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                if prefix {
                    prefix = false;
                    match key.code {
                        KeyCode::Char('d') | KeyCode::Char('D') => Some(DriverInput::Quit),
                        KeyCode::Char('r') | KeyCode::Char('R') => Some(DriverInput::Reconnect),
                        _ => {
                            let mut bytes = vec![PREFIX_KEY];
                            bytes.extend(key_event_to_bytes(&key));
                            Some(DriverInput::Data(bytes))
                        }
                    }
                } else if key.modifiers.contains(KeyModifiers::CONTROL)
                    && key.code == KeyCode::Char('b')
                {
                    prefix = true;
                    None
                } else {
                    let bytes = key_event_to_bytes(&key);
                    (!bytes.is_empty()).then_some(DriverInput::Data(bytes))
                }
            }
            Ok(Event::Paste(text)) => Some(DriverInput::Data(text.into_bytes())),
            Ok(Event::Resize(cols, rows)) => Some(DriverInput::Resize { cols, rows }),
            Ok(_) => None,
            Err(e) => {
                warn!("Terminal input error: {}", e);
                Some(DriverInput::Quit)
            }
        };
        if let Some(input) = input {
            let quit = input == DriverInput::Quit;
            if tx.send(input).is_err() || quit {
                break;
            }
        }
    }
}

fn key_event_to_bytes(key: &KeyEvent) -> Vec<u8> {
    let mods = key.modifiers;
    let param = xterm_modifier(mods);

    let mut bytes = match key.code {
        KeyCode::Char(c) if mods.contains(KeyModifiers::CONTROL) => match control_byte(c) {
            Some(byte) => vec![byte],
            None => encode_char(c),
        },
        KeyCode::Char(c) => encode_char(c),
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => vec![0x1b],
        // Cursor keys and F1-F4 carry modifiers as a CSI parameter.
        KeyCode::Up => csi_letter(b'A', param),
        KeyCode::Down => csi_letter(b'B', param),
        KeyCode::Right => csi_letter(b'C', param),
        KeyCode::Left => csi_letter(b'D', param),
        KeyCode::Home => csi_letter(b'H', param),
        KeyCode::End => csi_letter(b'F', param),
        KeyCode::F(n @ 1..=4) => match param {
            Some(m) => format!("\x1b[1;{}{}", m, (b'P' + n - 1) as char).into_bytes(),
            None => vec![0x1b, b'O', b'P' + n - 1],
        },
        KeyCode::Insert => csi_tilde(2, param),
        KeyCode::Delete => csi_tilde(3, param),
        KeyCode::PageUp => csi_tilde(5, param),
        KeyCode::PageDown => csi_tilde(6, param),
        KeyCode::F(n @ 5..=12) => {
            const CODES: [u8; 8] = [15, 17, 18, 19, 20, 21, 23, 24];
            csi_tilde(CODES[usize::from(n - 5)], param)
        }
        _ => return Vec::new(),
    };

    // Alt on plain keys is an ESC prefix; CSI keys already encode it.
    let is_csi = bytes.starts_with(b"\x1b[") || bytes.starts_with(b"\x1bO");
    if mods.contains(KeyModifiers::ALT) && !is_csi {
        bytes.insert(0, 0x1b);
    }
    bytes
}

fn encode_char(c: char) -> Vec<u8> {
    let mut buf = [0u8; 4];
    c.encode_utf8(&mut buf).as_bytes().to_vec()
}

/// C0 control code for Ctrl+`c`, e.g. Ctrl+C is 0x03 and Ctrl+[ is ESC.
fn control_byte(c: char) -> Option<u8> {
    match c.to_ascii_uppercase() {
        ' ' => Some(0x00),
        c @ ('@'..='_') => Some(c as u8 & 0x1f),
        '?' => Some(0x7f),
        _ => None,
    }
}

/// xterm modifier parameter (1 + shift + 2*alt + 4*ctrl), `None` when
/// no modifier is held.
fn xterm_modifier(mods: KeyModifiers) -> Option<u8> {
    let mut param = 1;
    if mods.contains(KeyModifiers::SHIFT) {
        param += 1;
    }
    if mods.contains(KeyModifiers::ALT) {
        param += 2;
    }
    if mods.contains(KeyModifiers::CONTROL) {
        param += 4;
    }
    (param > 1).then_some(param)
}

fn csi_letter(letter: u8, param: Option<u8>) -> Vec<u8> {
    match param {
        Some(m) => format!("\x1b[1;{}{}", m, letter as char).into_bytes(),
        None => vec![0x1b, b'[', letter],
    }
}

fn csi_tilde(code: u8, param: Option<u8>) -> Vec<u8> {
    match param {
        Some(m) => format!("\x1b[{};{}~", code, m).into_bytes(),
        None => format!("\x1b[{}~", code).into_bytes(),
    }
}

/// Raw mode plus alternate screen, undone on drop.
struct RawTerminal;

impl RawTerminal {
    fn enter() -> Result<Self> {
        terminal::enable_raw_mode()?;
        std::io::stdout().execute(EnterAlternateScreen)?;
        Ok(Self)
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = std::io::stdout().execute(LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

/// Writes session output to stdout and status notices to stderr.
#[derive(Default)]
struct StdoutSink {
    last_status: Option<ConnectionStatus>,
}

impl TerminalSink for StdoutSink {
    fn reset(&mut self) -> std::io::Result<()> {
        // RIS: full reset so modes left by the previous screen do not leak.
        let mut stdout = std::io::stdout();
        stdout.write_all(b"\x1bc")?;
        stdout.flush()
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let mut stdout = std::io::stdout();
        stdout.write_all(bytes)?;
        stdout.flush()
    }

    fn status(&mut self, status: ConnectionStatus) {
        let previous = self.last_status.replace(status);
        match status {
            ConnectionStatus::Connected if previous == Some(ConnectionStatus::Reconnecting) => {
                self.notice("Reconnected")
            }
            ConnectionStatus::Reconnecting => self.notice("Connection lost"),
            ConnectionStatus::Disconnected => {
                self.notice("Disconnected. Ctrl+B R starts a new connection, Ctrl+B D quits")
            }
            _ => {}
        }
    }

    fn notice(&mut self, message: &str) {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "\r\n\x1b[7m[cmux-relay] {}\x1b[0m\r\n", message);
        let _ = stderr.flush();
    }
}

pub async fn cmd_sessions(server: &str, credential: &str, json: bool) -> Result<()> {
    let url = format!("{}/sessions", server.trim_end_matches('/'));
    let mut request = reqwest::Client::new().get(&url);
    if !credential.is_empty() {
        request = request.bearer_auth(credential);
    }
    let sessions: Vec<SessionInfo> = request
        .send()
        .await
        .with_context(|| format!("failed to reach {}", url))?
        .error_for_status()?
        .json()
        .await
        .context("failed to parse session list")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    println!(
        "{:<36} {:<18} {:<8} {:>10} {:>8}",
        "ID", "STATE", "CLIENT", "BUFFERED", "GRACE"
    );
    println!("{}", "-".repeat(84));
    for session in sessions {
        let grace = session
            .grace_remaining_ms
            .map(|ms| format!("{}s", ms / 1000))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36} {:<18} {:<8} {:>10} {:>8}",
            session.session_id,
            session.state.as_str(),
            if session.attached { "yes" } else { "no" },
            session.buffered_bytes,
            grace
        );
    }
    Ok(())
}
