//! Client side of the relay
//!
//! [`ReconnectMachine`] decides what to do, [`ClientDriver`] does it over a
//! WebSocket, and a [`SessionStore`] remembers which session to resume.

mod driver;
mod machine;
mod policy;
mod store;

pub use driver::{ClientDriver, DriverConfig, DriverInput, DriverOutcome, TerminalSink};
pub use machine::{ClientAction, ClientEvent, ConnectionStatus, ReconnectMachine};
pub use policy::{ReconnectPolicy, MAX_RETRY_DELAY};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
