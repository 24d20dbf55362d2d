use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::Connection;
use super::message::{self, ServerMessage};
use super::registry::Registry;
use super::stats::{RelayStats, StatsSnapshot};
use crate::error::RelayError;
use crate::transport::{
    Accepted, CloseReason, InboundEvent, InboundStream, Listener, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    SHUTDOWN_REASON,
};

const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(30);
const MIN_LIVENESS_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub liveness_interval: Duration,
    /// Consecutive unacknowledged probes after which a peer is closed.
    /// `0` disables eviction.
    pub max_missed_probes: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            max_missed_probes: 0,
        }
    }
}

/// Why a connection's driving loop stopped.
#[derive(Debug)]
enum Exit {
    Peer(RelayError),
    Cancelled,
    LivenessTimeout,
}

/// Outcome of one broadcast fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FanOut {
    pub delivered: u64,
    pub failed: u64,
}

/// Routes messages between connections and owns their lifecycle.
///
/// Every accepted connection is driven by a single task that handles inbound
/// events, liveness ticks and cancellation, and runs the close path exactly
/// once when it stops.
pub struct RelayEngine {
    config: RelayConfig,
    registry: Registry,
    stats: RelayStats,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl RelayEngine {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            stats: RelayStats::default(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.count().await
    }

    /// Asks a single connection to close. Returns `false` if it is not
    /// registered.
    pub async fn disconnect(&self, id: &Uuid) -> bool {
        match self.registry.get(id).await {
            Some(connection) => {
                connection.request_close();
                true
            }
            None => false,
        }
    }

    /// Accepts connections until `signal` resolves, then shuts down: the
    /// accept loop stops first, every connection is closed and drained, and
    /// only then is the listener released.
    pub async fn run<L, F>(self: Arc<Self>, mut listener: L, signal: F)
    where
        L: Listener,
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        info!("relay engine accepting connections");

        let mut exhausted = false;
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("shutdown signal received");
                    break;
                }
                accepted = listener.accept(), if !exhausted => match accepted {
                    Some(accepted) => {
                        let engine = Arc::clone(&self);
                        self.tasks.spawn(async move {
                            engine.handle_connection(accepted).await;
                        });
                    }
                    None => {
                        // Open connections keep running until shutdown.
                        let err = RelayError::Server("listener closed".to_string());
                        error!(error = %err, "no further connections will be accepted");
                        exhausted = true;
                    }
                },
            }
        }

        listener.stop_accepting();
        self.drain().await;
        drop(listener);
        info!("relay engine stopped");
    }

    async fn drain(&self) {
        let open = self.registry.count().await;
        info!(connections = open, "closing all connections");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn handle_connection(self: Arc<Self>, accepted: Accepted) {
        let Accepted { peer, sink, mut events } = accepted;
        let connection = Arc::new(Connection::new(
            Uuid::new_v4(),
            peer,
            sink,
            self.shutdown.child_token(),
        ));

        if let Err(e) = self.registry.register(Arc::clone(&connection)).await {
            error!(conn_id = %connection.id(), error = %e, "failed to register connection");
            connection.close_transport(Some(CloseReason::new(CLOSE_INTERNAL_ERROR, "registration failed")));
            return;
        }
        connection.mark_open();
        self.stats.record_accepted();
        let open = self.registry.count().await;
        info!(
            conn_id = %connection.id(),
            peer = %connection.peer(),
            connections = open,
            "connection opened"
        );

        if let Err(e) = connection.send_message(&ServerMessage::welcome()) {
            self.stats.record_send_failure();
            warn!(conn_id = %connection.id(), error = %e, "failed to send welcome");
        }

        let exit = self.drive(&connection, &mut events).await;
        self.close_connection(&connection, exit).await;
    }

    async fn drive(&self, connection: &Connection, events: &mut InboundStream) -> Exit {
        let period = self.config.liveness_interval.max(MIN_LIVENESS_INTERVAL);
        let mut liveness = time::interval_at(Instant::now() + period, period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = connection.cancelled() => return Exit::Cancelled,
                event = events.next() => match event {
                    Some(InboundEvent::Payload(raw)) => self.route(connection, &raw).await,
                    Some(InboundEvent::ProbeAck) => {
                        connection.acknowledge_probe();
                        debug!(conn_id = %connection.id(), "liveness probe acknowledged");
                    }
                    Some(InboundEvent::Closed(reason)) => {
                        debug!(conn_id = %connection.id(), ?reason, "peer sent close frame");
                        return Exit::Peer(RelayError::RemoteClose);
                    }
                    Some(InboundEvent::Error(e)) => return Exit::Peer(RelayError::Transport(e)),
                    None => return Exit::Peer(RelayError::RemoteClose),
                },
                _ = liveness.tick() => {
                    if let Some(exit) = self.liveness_tick(connection) {
                        return exit;
                    }
                }
            }
        }
    }

    /// Echo to the origin first, then fan out to everyone else.
    async fn route(&self, origin: &Connection, raw: &[u8]) {
        let payload = match message::parse_payload(raw) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_parse_failure();
                debug!(conn_id = %origin.id(), error = %e, "rejecting malformed payload");
                if let Err(e) = origin.send_message(&ServerMessage::invalid_json()) {
                    self.stats.record_send_failure();
                    warn!(conn_id = %origin.id(), error = %e, "failed to send error notification");
                }
                return;
            }
        };

        self.stats.record_relayed();
        if let Err(e) = origin.send_message(&ServerMessage::echo(payload.clone())) {
            self.stats.record_send_failure();
            warn!(conn_id = %origin.id(), error = %e, "failed to send echo");
        }

        self.broadcast(origin.id(), &ServerMessage::broadcast(payload)).await;
    }

    /// Snapshot the registry, then dispatch to every open connection except
    /// `origin`. Each send is independent; failures are only counted and logged.
    pub(crate) async fn broadcast(&self, origin: Uuid, message: &ServerMessage) -> FanOut {
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!(conn_id = %origin, error = %e, "failed to serialize broadcast");
                return FanOut::default();
            }
        };

        let recipients = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|c| c.id() != origin && c.is_open());

        let mut fan_out = FanOut::default();
        for recipient in recipients {
            match recipient.send(text.clone()) {
                Ok(()) => fan_out.delivered += 1,
                Err(e) => {
                    fan_out.failed += 1;
                    warn!(conn_id = %recipient.id(), origin = %origin, error = %e, "broadcast delivery failed");
                }
            }
        }

        self.stats.record_fan_out(fan_out.delivered, fan_out.failed);
        debug!(
            origin = %origin,
            delivered = fan_out.delivered,
            failed = fan_out.failed,
            "broadcast dispatched"
        );
        fan_out
    }

    fn liveness_tick(&self, connection: &Connection) -> Option<Exit> {
        if !connection.is_open() {
            return None;
        }

        let missed = connection.begin_probe();
        let limit = self.config.max_missed_probes;
        if limit > 0 && missed >= limit {
            warn!(conn_id = %connection.id(), missed, "peer stopped answering liveness probes");
            return Some(Exit::LivenessTimeout);
        }

        match connection.probe() {
            Ok(()) => {
                self.stats.record_probe();
                debug!(conn_id = %connection.id(), missed, "liveness probe sent");
            }
            Err(e) => warn!(conn_id = %connection.id(), error = %e, "failed to send liveness probe"),
        }
        None
    }

    async fn close_connection(&self, connection: &Connection, exit: Exit) {
        if !connection.begin_close() {
            return;
        }

        let reason = match &exit {
            Exit::Peer(RelayError::RemoteClose) => {
                info!(conn_id = %connection.id(), "connection closed by peer");
                None
            }
            Exit::Peer(e) => {
                warn!(conn_id = %connection.id(), error = %e, "connection failed");
                None
            }
            Exit::Cancelled if self.shutdown.is_cancelled() => {
                Some(CloseReason::going_away(SHUTDOWN_REASON))
            }
            Exit::Cancelled => Some(CloseReason::new(CLOSE_NORMAL, "closed by server")),
            Exit::LivenessTimeout => {
                self.stats.record_eviction();
                Some(CloseReason::going_away("liveness timeout"))
            }
        };
        if let Some(reason) = reason {
            connection.close_transport(Some(reason));
        }

        self.registry.unregister(&connection.id()).await;
        connection.mark_closed();
        self.stats.record_closed();
        let remaining = self.registry.count().await;
        info!(conn_id = %connection.id(), connections = remaining, "connection closed");
    }
}
