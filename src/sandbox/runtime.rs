use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::handle::{LaunchedSandbox, SandboxSpec};
use crate::errors::{SandboxError, SandboxResult};

/// Backend that knows how to start one isolated environment.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a sandbox. Cancellation safe: dropping the future must not leak
    /// processes (spawn with `kill_on_drop`).
    async fn launch(&self, id: &str, spec: &SandboxSpec) -> SandboxResult<LaunchedSandbox>;

    /// Whether new sandboxes can currently be created.
    async fn health_check(&self) -> bool;
}

/// Runs shells directly on the host, without any isolation.
///
/// Meant for development and tests only.
pub struct HostRuntime {
    cwd: PathBuf,
}

impl HostRuntime {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

#[async_trait]
impl SandboxRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn launch(&self, id: &str, _spec: &SandboxSpec) -> SandboxResult<LaunchedSandbox> {
        if !self.cwd.is_dir() {
            return Err(SandboxError::Launch(format!(
                "working directory {} does not exist",
                self.cwd.display()
            )));
        }
        info!("[sandbox:{}] Host sandbox (no isolation)", id);
        Ok(LaunchedSandbox {
            keeper: None,
            entry: Vec::new(),
            cwd: self.cwd.clone(),
            owned_dir: None,
        })
    }

    async fn health_check(&self) -> bool {
        self.cwd.is_dir()
    }
}
