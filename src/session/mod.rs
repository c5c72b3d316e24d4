//! Session registry
//!
//! A session pairs one sandbox with one shell and outlives the connections
//! attached to it. While no connection is attached the shell keeps running,
//! its output keeps accumulating in a bounded [`OutputBuffer`], and a grace
//! timer decides when the session is torn down.

mod buffer;
mod registry;
mod state;
mod types;

pub use buffer::OutputBuffer;
pub use registry::{SessionHandle, SessionRegistry};
pub use state::SessionState;
pub use types::{Attachment, Outbound, SessionConfig, SessionInfo};
