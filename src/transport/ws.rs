use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Accepted, CloseReason, InboundEvent, Listener, PeerSink, SendError, SHUTDOWN_REASON};
use crate::error::RelayError;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket listener over TCP.
///
/// Handshakes run in their own tasks so a slow client never holds up the
/// accept loop, and each one is abandoned after the handshake timeout.
/// [`Listener::stop_accepting`] ends the accept loop and abandons handshakes
/// in flight. The port itself is released when the listener is dropped.
pub struct WsListener {
    local_addr: SocketAddr,
    incoming: mpsc::UnboundedReceiver<Accepted>,
    stop: CancellationToken,
    acceptor: JoinHandle<()>,
    // Keeps the port bound after the accept loop has stopped.
    _socket: Arc<TcpListener>,
}

impl WsListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, RelayError> {
        Self::bind_with_timeout(addr, DEFAULT_HANDSHAKE_TIMEOUT).await
    }

    pub async fn bind_with_timeout(
        addr: impl ToSocketAddrs,
        handshake_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let socket = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Server(format!("failed to bind listener: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| RelayError::Server(e.to_string()))?;
        let socket = Arc::new(socket);

        let (tx, incoming) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let acceptor = tokio::spawn(accept_loop(
            Arc::clone(&socket),
            tx,
            stop.clone(),
            handshake_timeout,
        ));

        info!(addr = %local_addr, ?handshake_timeout, "websocket listener bound");
        Ok(Self {
            local_addr,
            incoming,
            stop,
            acceptor,
            _socket: socket,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&mut self) -> Option<Accepted> {
        self.incoming.recv().await
    }

    fn stop_accepting(&mut self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.stop.cancel();
        self.incoming.close();
        // Upgraded before the stop but never handed out.
        while let Ok(queued) = self.incoming.try_recv() {
            let _ = queued.sink.close(Some(CloseReason::going_away(SHUTDOWN_REASON)));
        }
        info!(addr = %self.local_addr, "websocket listener stopped accepting");
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.stop.cancel();
        self.acceptor.abort();
        info!(addr = %self.local_addr, "websocket listener released");
    }
}

async fn accept_loop(
    socket: Arc<TcpListener>,
    tx: mpsc::UnboundedSender<Accepted>,
    stop: CancellationToken,
    handshake_timeout: Duration,
) {
    loop {
        let accepted = tokio::select! {
            biased;

            _ = stop.cancelled() => return,
            accepted = socket.accept() => accepted,
        };

        match accepted {
            Ok((raw_stream, addr)) => {
                let tx = tx.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    let handshake = tokio::time::timeout(
                        handshake_timeout,
                        tokio_tungstenite::accept_async(raw_stream),
                    );
                    let result = tokio::select! {
                        _ = stop.cancelled() => {
                            debug!(peer = %addr, "listener stopped; abandoning handshake");
                            return;
                        }
                        result = handshake => result,
                    };
                    match result {
                        Ok(Ok(ws_stream)) => {
                            if tx.send(establish(ws_stream, addr)).is_err() {
                                debug!(peer = %addr, "listener gone; dropping handshaken connection");
                            }
                        }
                        Ok(Err(e)) => {
                            warn!(peer = %addr, error = %e, "websocket handshake failed");
                        }
                        Err(_) => {
                            warn!(peer = %addr, timeout = ?handshake_timeout, "websocket handshake timed out");
                        }
                    }
                });
            }
            Err(e) => {
                let err = RelayError::Server(e.to_string());
                error!(error = %err, "failed to accept tcp connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn establish(ws_stream: WebSocketStream<TcpStream>, addr: SocketAddr) -> Accepted {
    let (mut ws_sink, ws_stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Forward queued frames to the socket. Ends after a close frame or once
    // every sender is gone.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = message.is_close();
            if let Err(e) = ws_sink.send(message).await {
                debug!(peer = %addr, error = %e, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }

        if let Err(e) = ws_sink.close().await {
            debug!(peer = %addr, error = %e, "error closing websocket sink");
        }
    });

    let events = ws_stream
        .filter_map(|item| async move {
            match item {
                Ok(Message::Text(text)) => Some(InboundEvent::Payload(text.into_bytes())),
                Ok(Message::Binary(data)) => Some(InboundEvent::Payload(data)),
                Ok(Message::Pong(_)) => Some(InboundEvent::ProbeAck),
                Ok(Message::Close(frame)) => Some(InboundEvent::Closed(frame.map(|f| {
                    CloseReason::new(u16::from(f.code), f.reason.into_owned())
                }))),
                // tungstenite answers pings itself
                Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => None,
                Err(e) => Some(InboundEvent::Error(e.to_string())),
            }
        })
        .boxed();

    Accepted::new(addr.to_string(), std::sync::Arc::new(WsSink { tx }), events)
}

struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl WsSink {
    fn push(&self, message: Message) -> Result<(), SendError> {
        self.tx.send(message).map_err(|_| SendError::Closed)
    }
}

impl PeerSink for WsSink {
    fn send(&self, text: String) -> Result<(), SendError> {
        self.push(Message::Text(text))
    }

    fn probe(&self) -> Result<(), SendError> {
        self.push(Message::Ping(Vec::new()))
    }

    fn close(&self, reason: Option<CloseReason>) -> Result<(), SendError> {
        self.push(Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })))
    }
}
