//! In-process transport.
//!
//! Gives tests and embedders a way to drive the relay engine without sockets:
//! [`pair`] returns a [`MemoryListener`] to hand to the engine and a
//! [`MemoryConnector`] that opens [`MemoryClient`]s against it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use super::{
    Accepted, CloseReason, InboundEvent, Listener, PeerSink, SendError, CLOSE_NORMAL,
    SHUTDOWN_REASON,
};

/// What a client observes from the server side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Probe,
    Close(Option<CloseReason>),
}

pub fn pair() -> (MemoryListener, MemoryConnector) {
    let (tx, incoming) = mpsc::unbounded_channel();
    (
        MemoryListener { incoming },
        MemoryConnector {
            tx,
            next_peer: Arc::new(AtomicU64::new(1)),
        },
    )
}

pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<Accepted>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Option<Accepted> {
        self.incoming.recv().await
    }

    fn stop_accepting(&mut self) {
        self.incoming.close();
        while let Ok(queued) = self.incoming.try_recv() {
            let _ = queued.sink.close(Some(CloseReason::going_away(SHUTDOWN_REASON)));
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<Accepted>,
    next_peer: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Opens a connection. Returns `None` once the listener is gone.
    pub fn connect(&self) -> Option<MemoryClient> {
        let peer = format!("memory-{}", self.next_peer.fetch_add(1, Ordering::Relaxed));
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();

        let sink = Arc::new(MemorySink {
            tx: to_client,
            closed: AtomicBool::new(false),
        });
        let events = stream::unfold(from_client, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();

        self.tx
            .send(Accepted::new(peer.clone(), sink, events))
            .ok()?;

        Some(MemoryClient {
            peer,
            outbound: to_server,
            inbound: from_server,
        })
    }
}

/// Client end of an in-memory connection. Dropping it looks like the
/// transport going away.
pub struct MemoryClient {
    peer: String,
    outbound: mpsc::UnboundedSender<InboundEvent>,
    inbound: mpsc::UnboundedReceiver<ClientFrame>,
}

impl MemoryClient {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_bytes(text.into().into_bytes())
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) -> bool {
        self.push(InboundEvent::Payload(bytes))
    }

    pub fn ack_probe(&self) -> bool {
        self.push(InboundEvent::ProbeAck)
    }

    /// Sends a normal close frame.
    pub fn close(&self) -> bool {
        self.push(InboundEvent::Closed(Some(CloseReason::new(
            CLOSE_NORMAL,
            "client closing",
        ))))
    }

    /// Reports an unrecoverable transport failure to the server.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.push(InboundEvent::Error(reason.into()))
    }

    /// Stops accepting frames from the server. Every later server-side send
    /// to this client fails, while the connection itself stays up.
    pub fn stop_receiving(&mut self) {
        self.inbound.close();
    }

    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        self.inbound.try_recv().ok()
    }

    /// Next text frame parsed as JSON, skipping liveness probes.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.recv().await? {
                ClientFrame::Text(text) => return serde_json::from_str(&text).ok(),
                ClientFrame::Probe => continue,
                ClientFrame::Close(_) => return None,
            }
        }
    }

    fn push(&self, event: InboundEvent) -> bool {
        self.outbound.send(event).is_ok()
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<ClientFrame>,
    closed: AtomicBool,
}

impl MemorySink {
    fn push(&self, frame: ClientFrame) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.tx.send(frame).map_err(|_| SendError::Closed)
    }
}

impl PeerSink for MemorySink {
    fn send(&self, text: String) -> Result<(), SendError> {
        self.push(ClientFrame::Text(text))
    }

    fn probe(&self) -> Result<(), SendError> {
        self.push(ClientFrame::Probe)
    }

    fn close(&self, reason: Option<CloseReason>) -> Result<(), SendError> {
        let result = self.push(ClientFrame::Close(reason));
        self.closed.store(true, Ordering::Release);
        result
    }
}
