//! Transport abstraction consumed by the relay engine.
//!
//! A transport yields established connections. Each one is split into an
//! outbound [`PeerSink`] and a stream of [`InboundEvent`]s. Sends never block
//! the caller: implementations queue frames and deliver them from a
//! per-connection writer, so a stalled peer only stalls itself.

pub mod memory;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint is going away (server shutdown, liveness eviction).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Unexpected condition on the server side.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close reason sent with 1001 when the server shuts down.
pub const SHUTDOWN_REASON: &str = "server shutting down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn going_away(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_GOING_AWAY, reason)
    }
}

/// Everything a transport can report about a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A complete application message, text or binary.
    Payload(Vec<u8>),
    /// The peer answered a liveness probe.
    ProbeAck,
    /// The peer sent a close frame.
    Closed(Option<CloseReason>),
    /// Unrecoverable transport failure.
    Error(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transport closed")]
    Closed,

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Outbound half of a connection.
#[cfg_attr(test, automock)]
pub trait PeerSink: Send + Sync {
    /// Queues a text frame for delivery.
    fn send(&self, text: String) -> Result<(), SendError>;

    /// Queues a liveness probe (a control frame, not a payload message).
    fn probe(&self) -> Result<(), SendError>;

    /// Queues a close frame; the transport shuts down once it is written.
    fn close(&self, reason: Option<CloseReason>) -> Result<(), SendError>;
}

pub type InboundStream = BoxStream<'static, InboundEvent>;

/// An established connection handed over by a [`Listener`].
pub struct Accepted {
    pub peer: String,
    pub sink: Arc<dyn PeerSink>,
    pub events: InboundStream,
}

impl Accepted {
    pub fn new(peer: impl Into<String>, sink: Arc<dyn PeerSink>, events: InboundStream) -> Self {
        Self {
            peer: peer.into(),
            sink,
            events,
        }
    }
}

/// Source of incoming connections.
#[async_trait]
pub trait Listener: Send {
    /// Waits for the next established connection. `None` means the listener
    /// will never yield another one.
    async fn accept(&mut self) -> Option<Accepted>;

    /// Refuses every connection that has not been handed out yet. Connections
    /// established but still queued are closed with 1001. The listening
    /// resource itself stays held until the listener is dropped.
    fn stop_accepting(&mut self) {}
}
