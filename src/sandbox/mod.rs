//! Sandbox supervision
//!
//! One isolated execution environment per terminal session:
//! - `BubblewrapRuntime` for namespaced sandboxes (production)
//! - `HostRuntime` for running shells directly on the host (development)
//!
//! The [`SandboxSupervisor`] owns every live handle so that process shutdown
//! can tear all of them down.

mod bubblewrap;
mod handle;
mod runtime;
mod supervisor;

pub use bubblewrap::{BubblewrapRuntime, ResourceLimits};
pub use handle::{LaunchedSandbox, SandboxHandle, SandboxSpec};
pub use runtime::{HostRuntime, SandboxRuntime};
pub use supervisor::{SandboxCredentials, SandboxSupervisor, SupervisorConfig};
