use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;
use uuid::Uuid;

use super::message::ServerMessage;
use crate::error::RelayError;
use crate::transport::{CloseReason, PeerSink};

/// Lifecycle of a connection, mirroring the transport's own states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    AwaitingProbe,
    ProbeOutstanding,
}

/// One peer session. Shared between the registry and the task driving it.
pub struct Connection {
    id: Uuid,
    peer: String,
    sink: Arc<dyn PeerSink>,
    state: AtomicU8,
    probe_outstanding: AtomicBool,
    missed_probes: AtomicU32,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(id: Uuid, peer: impl Into<String>, sink: Arc<dyn PeerSink>, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer: peer.into(),
            sink,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            probe_outstanding: AtomicBool::new(false),
            missed_probes: AtomicU32::new(0),
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn liveness(&self) -> LivenessState {
        if self.probe_outstanding.load(Ordering::Acquire) {
            LivenessState::ProbeOutstanding
        } else {
            LivenessState::AwaitingProbe
        }
    }

    pub fn missed_probes(&self) -> u32 {
        self.missed_probes.load(Ordering::Acquire)
    }

    /// Asks the task driving this connection to close it.
    pub fn request_close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn mark_open(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Open)
    }

    /// Moves to `Closing`. Only the first caller gets `true`, which makes it
    /// the owner of the close path.
    pub(crate) fn begin_close(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Closing)
            || self.transition(ConnectionState::Connecting, ConnectionState::Closing)
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn send(&self, text: String) -> Result<(), RelayError> {
        if !self.is_open() {
            return Err(RelayError::send_failure(self.id, "connection is not open"));
        }
        self.sink
            .send(text)
            .map_err(|e| RelayError::send_failure(self.id, e))
    }

    pub fn send_message(&self, message: &ServerMessage) -> Result<(), RelayError> {
        self.send(message.to_text()?)
    }

    /// Records a liveness tick and returns how many consecutive probes were
    /// still unanswered when it fired.
    pub(crate) fn begin_probe(&self) -> u32 {
        if self.probe_outstanding.swap(true, Ordering::AcqRel) {
            self.missed_probes.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            0
        }
    }

    pub(crate) fn probe(&self) -> Result<(), RelayError> {
        if !self.is_open() {
            return Err(RelayError::send_failure(self.id, "connection is not open"));
        }
        self.sink
            .probe()
            .map_err(|e| RelayError::send_failure(self.id, e))
    }

    pub(crate) fn acknowledge_probe(&self) {
        self.probe_outstanding.store(false, Ordering::Release);
        self.missed_probes.store(0, Ordering::Release);
    }

    /// Sends a close frame regardless of state; used by the close path.
    pub(crate) fn close_transport(&self, reason: Option<CloseReason>) {
        if let Err(e) = self.sink.close(reason) {
            debug!(conn_id = %self.id, error = %e, "close frame not delivered");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("liveness", &self.liveness())
            .finish_non_exhaustive()
    }
}
