//! WebSocket relay for Podium session sync.
//!
//! Peers connect to `/ws/{session}`. Every text frame is re-validated as a
//! session-sync envelope, re-serialized, and forwarded to the other peers in
//! the same session. The relay never resolves conflicts; students do.

pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod state;

pub use server::{relay_router, start_relay};
pub use state::RelayState;
