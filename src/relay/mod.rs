//! Connection registry and the relay engine built on top of it.
//!
//! The engine echoes every valid inbound message to its sender, broadcasts
//! it to every other open connection, and probes each connection for
//! liveness on a fixed interval.

mod connection;
mod engine;
mod message;
mod registry;
mod stats;

pub use connection::{Connection, ConnectionState, LivenessState};
pub use engine::{RelayConfig, RelayEngine};
pub use message::{parse_payload, timestamp, ServerMessage, INVALID_JSON, WELCOME_MESSAGE};
pub use registry::Registry;
pub use stats::{RelayStats, StatsSnapshot};
