//! Resumable terminal relay.
//!
//! A shell runs in a PTY inside a per-session sandbox. Clients reach it over
//! a WebSocket; when the transport drops, the session is held for a grace
//! period while its output keeps buffering, and a reconnecting client gets
//! the buffered output replayed before live output resumes.

pub mod client;
pub mod errors;
pub mod protocol;
pub mod pty;
pub mod relay;
pub mod sandbox;
pub mod session;
