use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use which::which;

use super::handle::{LaunchedSandbox, SandboxSpec};
use super::runtime::SandboxRuntime;
use crate::errors::{SandboxError, SandboxResult};

/// Per-shell resource limits, applied with `prlimit` when the shell enters
/// the sandbox.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// RLIMIT_NPROC
    pub max_processes: u64,
    /// RLIMIT_AS in bytes
    pub max_memory_bytes: u64,
    /// RLIMIT_NOFILE
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_processes: 256,
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            max_open_files: 1024,
        }
    }
}

#[derive(Deserialize)]
struct BwrapStatus {
    #[serde(rename = "child-pid")]
    child_pid: u32,
}

/// Namespaced sandboxes built on bubblewrap.
///
/// Each sandbox gets fresh network, pid, ipc and uts namespaces, a read-only
/// view of the host system directories and a private writable workspace at
/// `/workspace`. Shells are placed inside with `nsenter`.
pub struct BubblewrapRuntime {
    workspace_root: PathBuf,
    bubblewrap_path: String,
    nsenter_path: String,
    prlimit_path: String,
    limits: ResourceLimits,
}

impl BubblewrapRuntime {
    pub async fn new(workspace_root: PathBuf, limits: ResourceLimits) -> SandboxResult<Self> {
        if !workspace_root.exists() {
            fs::create_dir_all(&workspace_root).await?;
        }

        Ok(Self {
            workspace_root,
            bubblewrap_path: find_binary("bwrap")?,
            nsenter_path: find_binary("nsenter")?,
            prlimit_path: find_binary("prlimit")?,
            limits,
        })
    }

    fn bwrap_args(&self, workspace: &str, hostname: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "--die-with-parent",
            "--unshare-net",
            "--unshare-pid",
            "--unshare-uts",
            "--unshare-ipc",
            "--dev",
            "/dev",
            "--proc",
            "/proc",
            "--perms",
            "1777",
            "--tmpfs",
            "/tmp",
            "--tmpfs",
            "/run",
            "--ro-bind",
            "/usr",
            "/usr",
            "--ro-bind",
            "/etc",
            "/etc",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        for path_str in ["/bin", "/sbin", "/lib", "/lib64"] {
            let path = Path::new(path_str);
            match std::fs::symlink_metadata(path) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    if let Ok(target) = std::fs::read_link(path) {
                        args.push("--symlink".to_string());
                        args.push(target.to_string_lossy().to_string());
                        args.push(path_str.to_string());
                    }
                }
                Ok(_) => {
                    args.push("--ro-bind".to_string());
                    args.push(path_str.to_string());
                    args.push(path_str.to_string());
                }
                Err(_) => {}
            }
        }

        args.extend(
            [
                "--bind",
                workspace,
                "/workspace",
                "--chdir",
                "/workspace",
                "--hostname",
                hostname,
                "--json-status-fd",
                "1",
                "--",
                "/bin/sh",
                "-c",
                "ip link set lo up 2>/dev/null; exec sleep infinity",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args
    }

    fn entry_prefix(&self, pid: u32) -> Vec<String> {
        vec![
            self.prlimit_path.clone(),
            format!("--nproc={}", self.limits.max_processes),
            format!("--as={}", self.limits.max_memory_bytes),
            format!("--nofile={}", self.limits.max_open_files),
            "--".to_string(),
            self.nsenter_path.clone(),
            "--target".to_string(),
            pid.to_string(),
            "--mount".to_string(),
            "--uts".to_string(),
            "--ipc".to_string(),
            "--net".to_string(),
            "--pid".to_string(),
            "--wd=/workspace".to_string(),
            "--".to_string(),
        ]
    }
}

#[async_trait]
impl SandboxRuntime for BubblewrapRuntime {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    async fn launch(&self, id: &str, spec: &SandboxSpec) -> SandboxResult<LaunchedSandbox> {
        let sandbox_root = self.workspace_root.join(id);
        let workspace = sandbox_root.join("workspace");
        fs::create_dir_all(&workspace).await?;

        let workspace_str = workspace
            .to_str()
            .ok_or_else(|| SandboxError::Launch("workspace path is not valid UTF-8".into()))?
            .to_owned();
        let short_id: String = id.chars().take(8).collect();
        let args = self.bwrap_args(&workspace_str, &format!("sandbox-{short_id}"));
        debug!("[sandbox:{}] bwrap {:?}", id, args);

        let mut command = Command::new(&self.bubblewrap_path);
        command
            .args(&args)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = fs::remove_dir_all(&sandbox_root).await;
                return Err(SandboxError::Launch(format!("failed to spawn bwrap: {e}")));
            }
        };

        let status = match read_status(&mut child).await {
            Ok(status) => status,
            Err(e) => {
                let _ = child.kill().await;
                let _ = fs::remove_dir_all(&sandbox_root).await;
                return Err(e);
            }
        };

        info!(
            "[sandbox:{}] Bubblewrap sandbox started (ns pid: {})",
            id, status.child_pid
        );

        Ok(LaunchedSandbox {
            keeper: Some(child),
            entry: self.entry_prefix(status.child_pid),
            cwd: PathBuf::from("/workspace"),
            owned_dir: Some(sandbox_root),
        })
    }

    async fn health_check(&self) -> bool {
        match Command::new(&self.bubblewrap_path)
            .arg("--version")
            .output()
            .await
        {
            Ok(output) if output.status.success() => self.workspace_root.is_dir(),
            Ok(output) => {
                warn!("bwrap --version exited with {}", output.status);
                false
            }
            Err(e) => {
                warn!("bwrap health check failed: {}", e);
                false
            }
        }
    }
}

async fn read_status(child: &mut tokio::process::Child) -> SandboxResult<BwrapStatus> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Launch("failed to capture bwrap stdout".into()))?;

    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Err(SandboxError::Launch(
            "bwrap exited before reporting status".into(),
        ));
    }

    serde_json::from_str(&line).map_err(|e| {
        SandboxError::Launch(format!("failed to parse bwrap status: {e}, line: {line}"))
    })
}

fn find_binary(name: &str) -> SandboxResult<String> {
    let path = which(name)
        .map_err(|_| SandboxError::Unavailable(format!("{name} not found in PATH")))?;
    Ok(path.to_string_lossy().to_string())
}
