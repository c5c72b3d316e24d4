//! PTY bridge
//!
//! Runs the interactive shell of a session in a pseudo-terminal inside its
//! sandbox and moves raw bytes in and out of it:
//! - input goes through a dedicated writer thread
//! - output is read on the blocking pool and delivered as [`PtyEvent`]s
//! - the exit event is delivered exactly once, after the last output

mod bridge;
mod shell;

pub use bridge::{PtyBridge, PtyEvent};
pub use shell::{resolve_default_shell, ShellConfig};
