//! Relay server
//!
//! Accepts WebSocket connections on `/ws`, validates the `attach` handshake,
//! creates or resumes a session and streams frames both ways. Transport loss
//! only detaches; sessions end when their shell exits or their grace period
//! runs out.

mod auth;
mod connection;
mod server;

pub use auth::{AuthError, Authenticator, ClientIdentity, CredentialPolicy};
pub use connection::{Connection, CLOSE_SUPERSEDED};
pub use server::{RelayConfig, RelayServer, RelayState};
