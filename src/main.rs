//! cmux-relay binary entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cmux_relay::client::ReconnectPolicy;
use cmux_relay::relay::CredentialPolicy;

mod cli;

use cli::{AttachOptions, RuntimeKind, ServeOptions};

/// Resumable terminal relay.
#[derive(Parser, Debug)]
#[command(name = "cmux-relay")]
#[command(about = "Sandboxed shells over WebSocket that survive reconnects")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to a daily rotated file in this directory
    #[arg(long, env = "CMUX_RELAY_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Serve(ServeArgs),
    /// Attach this terminal to a session on a relay
    Attach(AttachArgs),
    /// List the sessions held by a relay
    Sessions {
        /// Relay base URL
        #[arg(long, env = "CMUX_RELAY_SERVER", default_value = "http://127.0.0.1:39390")]
        server: String,

        /// Credential used for the listing; only sessions it may resume are shown
        #[arg(long, env = "CMUX_RELAY_CREDENTIAL", default_value = "")]
        credential: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "CMUX_RELAY_BIND", default_value = "127.0.0.1:39390")]
    bind: SocketAddr,

    /// Sandbox backend
    #[arg(long, env = "CMUX_RELAY_RUNTIME", value_enum, default_value = "bubblewrap")]
    runtime: RuntimeKind,

    /// Directory holding per-session workspaces
    #[arg(long, env = "CMUX_RELAY_WORKSPACE_ROOT", default_value = "/var/lib/cmux-relay")]
    workspace_root: PathBuf,

    /// Shared token clients must present
    #[arg(long, env = "CMUX_RELAY_TOKEN", conflicts_with = "jwt_secret")]
    token: Option<String>,

    /// HS256 secret for client JWTs (repeat to accept several during rotation)
    #[arg(long, env = "CMUX_RELAY_JWT_SECRET", value_delimiter = ',')]
    jwt_secret: Vec<String>,

    /// Accept any credential. Development only.
    #[arg(long)]
    insecure_no_auth: bool,

    /// Seconds a detached session is kept before it is torn down
    #[arg(long, env = "CMUX_RELAY_GRACE_SECS", default_value = "60")]
    grace_secs: u64,

    /// Bytes of output kept for replay per session
    #[arg(long, env = "CMUX_RELAY_BUFFER_BYTES", default_value = "262144")]
    buffer_bytes: usize,

    /// Text written to a new session's terminal before the shell's output
    #[arg(long, env = "CMUX_RELAY_BANNER")]
    banner: Option<String>,

    /// Shell to run (defaults to $SHELL, then bash, then sh)
    #[arg(long, env = "CMUX_RELAY_SHELL")]
    shell: Option<String>,

    /// Maximum number of concurrent sandboxes
    #[arg(long, env = "CMUX_RELAY_MAX_SANDBOXES", default_value = "64")]
    max_sandboxes: usize,

    /// Seconds allowed for creating a sandbox
    #[arg(long, env = "CMUX_RELAY_CREATE_TIMEOUT_SECS", default_value = "30")]
    create_timeout_secs: u64,

    /// Seconds between heartbeats; a connection silent for three is dropped
    #[arg(long, env = "CMUX_RELAY_HEARTBEAT_SECS", default_value = "15")]
    heartbeat_secs: u64,
}

#[derive(Args, Debug)]
struct AttachArgs {
    /// Relay WebSocket URL
    #[arg(long, env = "CMUX_RELAY_URL", default_value = "ws://127.0.0.1:39390/ws")]
    url: String,

    /// Credential sent in the handshake
    #[arg(long, env = "CMUX_RELAY_CREDENTIAL", default_value = "")]
    credential: String,

    /// Key under which the session id is remembered (defaults to the URL)
    #[arg(long)]
    scope: Option<String>,

    /// Start a new session even if one is remembered
    #[arg(long)]
    new: bool,

    /// First reconnect delay in milliseconds
    #[arg(long, default_value = "500")]
    backoff_base_ms: u64,

    /// Longest reconnect delay in milliseconds
    #[arg(long, default_value = "30000")]
    backoff_max_ms: u64,

    /// Random extra delay, as a fraction of the delay
    #[arg(long, default_value = "0.25")]
    backoff_jitter: f64,

    /// Reconnect attempts before asking the user (0 retries forever)
    #[arg(long, default_value = "20")]
    max_attempts: u32,
}

impl ServeArgs {
    fn into_options(self) -> Result<ServeOptions> {
        let auth = if let Some(token) = self.token.as_deref() {
            CredentialPolicy::shared_token(token)
        } else if !self.jwt_secret.is_empty() {
            CredentialPolicy::jwt(self.jwt_secret)
        } else if self.insecure_no_auth {
            CredentialPolicy::Disabled
        } else {
            anyhow::bail!("one of --token, --jwt-secret or --insecure-no-auth is required");
        };
        Ok(ServeOptions {
            bind: self.bind,
            runtime: self.runtime,
            workspace_root: self.workspace_root,
            auth,
            grace_period: Duration::from_secs(self.grace_secs),
            buffer_capacity: self.buffer_bytes,
            banner: self.banner,
            shell: self.shell,
            max_sandboxes: self.max_sandboxes,
            creation_timeout: Duration::from_secs(self.create_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
        })
    }
}

impl AttachArgs {
    fn into_options(self) -> AttachOptions {
        let policy = ReconnectPolicy::default()
            .with_base_delay(Duration::from_millis(self.backoff_base_ms))
            .with_max_delay(Duration::from_millis(self.backoff_max_ms))
            .with_jitter(self.backoff_jitter)
            .with_max_attempts((self.max_attempts > 0).then_some(self.max_attempts));
        AttachOptions {
            url: self.url,
            credential: self.credential,
            scope: self.scope,
            policy,
            fresh: self.new,
        }
    }
}

/// `attach` owns the terminal, so its logs only go to the file (if any).
fn init_tracing(verbose: bool, log_dir: Option<&PathBuf>, to_stderr: bool) -> Option<WorkerGuard> {
    let filter = || {
        if verbose {
            EnvFilter::default().add_directive(Level::DEBUG.into())
        } else {
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()))
        }
    };

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cmux-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None if to_stderr => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
            None
        }
        None => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let interactive = matches!(cli.command, Command::Attach(_));
    let _guard = init_tracing(cli.verbose, cli.log_dir.as_ref(), !interactive);

    match cli.command {
        Command::Serve(args) => {
            let options = args.into_options()?;
            info!(
                bind = %options.bind,
                runtime = ?options.runtime,
                auth = options.auth.name(),
                grace_secs = options.grace_period.as_secs(),
                buffer_bytes = options.buffer_capacity,
                "Starting cmux-relay"
            );
            cli::cmd_serve(options).await
        }
        Command::Attach(args) => cli::cmd_attach(args.into_options()).await,
        Command::Sessions {
            server,
            credential,
            json,
        } => cli::cmd_sessions(&server, &credential, json).await,
    }
}
