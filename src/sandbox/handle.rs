use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use portable_pty::CommandBuilder;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// `PATH` given to every process started in a sandbox.
pub const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Environment a runtime should start the sandbox with.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    pub env: Vec<(String, String)>,
}

/// What a runtime hands back after a successful launch.
pub struct LaunchedSandbox {
    /// Process that keeps the sandbox namespaces alive, if the runtime has one.
    pub keeper: Option<Child>,
    /// Command prefix that places a program inside the sandbox
    /// (e.g. `nsenter --target <pid> ... --`). Empty for the host runtime.
    pub entry: Vec<String>,
    /// Working directory for shells, as seen from inside the sandbox.
    pub cwd: PathBuf,
    /// Host directory removed when the sandbox is destroyed.
    pub owned_dir: Option<PathBuf>,
}

/// A handle to a running sandbox.
///
/// Cloning is cheap; every clone refers to the same sandbox. The first
/// [`SandboxHandle::shutdown`] does the work, later calls are no-ops.
#[derive(Clone)]
pub struct SandboxHandle {
    inner: Arc<SandboxInner>,
}

struct SandboxInner {
    id: String,
    runtime: &'static str,
    entry: Vec<String>,
    cwd: PathBuf,
    env: Vec<(String, String)>,
    owned_dir: Option<PathBuf>,
    keeper: Mutex<Option<Child>>,
    keeper_pid: Option<u32>,
    destroyed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl SandboxHandle {
    pub(crate) fn new(
        id: String,
        runtime: &'static str,
        launched: LaunchedSandbox,
        env: Vec<(String, String)>,
    ) -> Self {
        let keeper_pid = launched.keeper.as_ref().and_then(|child| child.id());
        Self {
            inner: Arc::new(SandboxInner {
                id,
                runtime,
                entry: launched.entry,
                cwd: launched.cwd,
                env,
                owned_dir: launched.owned_dir,
                keeper: Mutex::new(launched.keeper),
                keeper_pid,
                destroyed: AtomicBool::new(false),
                created_at: Utc::now(),
            }),
        }
    }

    /// Returns the sandbox's unique identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Name of the runtime that launched this sandbox.
    pub fn runtime(&self) -> &'static str {
        self.inner.runtime
    }

    pub fn cwd(&self) -> &Path {
        &self.inner.cwd
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.inner.env
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// True while the sandbox can host new processes.
    pub fn is_ready(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        match self.inner.keeper_pid {
            // Signal 0 only checks that the process still exists.
            Some(pid) => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
            None => true,
        }
    }

    /// Build a command that runs `program` inside the sandbox.
    ///
    /// The relay's own environment is not inherited; the command sees
    /// `PATH`, `HOME` and the sandbox's env only.
    pub fn command(&self, program: &str) -> CommandBuilder {
        let mut cmd = match self.inner.entry.split_first() {
            Some((launcher, args)) => {
                let mut cmd = CommandBuilder::new(launcher);
                cmd.args(args);
                cmd.arg(program);
                cmd
            }
            None => CommandBuilder::new(program),
        };

        if self.inner.entry.is_empty() {
            cmd.cwd(&self.inner.cwd);
        }
        cmd.env_clear();
        cmd.env("PATH", SANDBOX_PATH);
        cmd.env("HOME", &self.inner.cwd);
        for (key, value) in &self.inner.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Stop the sandbox: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Returns `false` when another caller already destroyed it.
    pub(crate) async fn shutdown(&self, grace: Duration) -> bool {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            debug!("[sandbox:{}] Already destroyed", self.inner.id);
            return false;
        }

        let keeper = self.inner.keeper.lock().take();
        if let Some(mut child) = keeper {
            stop_child(&self.inner.id, &mut child, grace).await;
        }

        if let Some(dir) = &self.inner.owned_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "[sandbox:{}] Failed to remove {}: {}",
                        self.inner.id,
                        dir.display(),
                        e
                    );
                }
            }
        }

        info!("[sandbox:{}] Destroyed", self.inner.id);
        true
    }
}

async fn stop_child(id: &str, child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("[sandbox:{}] Keeper already exited: {}", id, status);
            return;
        }
        Ok(None) => {}
        Err(e) => warn!("[sandbox:{}] Failed to poll keeper: {}", id, e),
    }

    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("[sandbox:{}] Keeper stopped: {}", id, status),
        Ok(Err(e)) => warn!("[sandbox:{}] Failed to wait for keeper: {}", id, e),
        Err(_) => {
            warn!(
                "[sandbox:{}] SIGTERM timeout after {:?}, sending SIGKILL",
                id, grace
            );
            if let Err(e) = child.kill().await {
                warn!("[sandbox:{}] SIGKILL failed: {}", id, e);
            }
        }
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.inner.id)
            .field("runtime", &self.inner.runtime)
            .field("cwd", &self.inner.cwd)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
