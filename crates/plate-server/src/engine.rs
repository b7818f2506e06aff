use std::collections::HashMap;
use std::sync::Arc;

use plate_core::{ConnectionId, PairingCode, Role, ServerEvent};
use plate_telemetry::MetricsRecorder;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::registry::RoomRegistry;

pub const METRIC_CONNECTIONS: &str = "relay.connections";
pub const METRIC_ROOMS: &str = "relay.rooms";
pub const METRIC_JOINS: &str = "relay.joins";
pub const METRIC_RELAYED: &str = "relay.delivered";
pub const METRIC_DROPPED: &str = "relay.dropped";
pub const METRIC_IGNORED: &str = "relay.ignored";

/// Per-connection outbound queue, drained by the connection's writer task.
pub type Outbox = mpsc::Sender<Arc<String>>;

/// Commands the connection tasks send to the relay engine.
#[derive(Debug)]
pub enum EngineCommand {
    Connect {
        session: ConnectionId,
        outbox: Outbox,
    },
    Join {
        session: ConnectionId,
        code: PairingCode,
        role: Role,
    },
    Select {
        session: ConnectionId,
        code: PairingCode,
        key: Value,
    },
    EndSession {
        session: ConnectionId,
        code: PairingCode,
    },
    Disconnect {
        session: ConnectionId,
    },
    FreshCode {
        reply: oneshot::Sender<PairingCode>,
    },
}

/// Message-routing core.
///
/// Owns the room registry and every connection's outbox. It runs as a single
/// task fed by one command channel, so each command is applied to completion
/// before the next and the registry needs no lock. Delivery is best-effort:
/// a full or closed outbox loses the event, nothing is retried or queued.
pub struct RelayEngine {
    registry: RoomRegistry,
    outboxes: HashMap<ConnectionId, Outbox>,
    metrics: Arc<MetricsRecorder>,
}

impl RelayEngine {
    pub fn new(registry: RoomRegistry, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            registry,
            outboxes: HashMap::new(),
            metrics,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    /// Apply one command.
    pub fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Connect { session, outbox } => self.connect(session, outbox),
            EngineCommand::Join {
                session,
                code,
                role,
            } => self.join(session, code, role),
            EngineCommand::Select { session, code, key } => self.select(&session, &code, key),
            EngineCommand::EndSession { session, code } => self.end_session(&session, &code),
            EngineCommand::Disconnect { session } => self.disconnect(&session),
            EngineCommand::FreshCode { reply } => {
                let code = self.registry.fresh_code(&mut rand::thread_rng());
                let _ = reply.send(code);
            }
        }
    }

    /// Drain commands until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        tracing::info!(
            connections = self.outboxes.len(),
            rooms = self.registry.room_count(),
            "Relay engine stopped"
        );
    }

    /// Spawn the engine on its own task.
    pub fn spawn(self, capacity: usize) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(self.run(rx));
        (EngineHandle { tx }, task)
    }

    fn connect(&mut self, session: ConnectionId, outbox: Outbox) {
        if self.outboxes.insert(session.clone(), outbox).is_none() {
            self.metrics.gauge_inc(METRIC_CONNECTIONS, 1);
        }
        tracing::debug!(conn_id = %session, "Connection registered");
    }

    fn join(&mut self, session: ConnectionId, code: PairingCode, role: Role) {
        if code.is_empty() {
            self.ignore(&session, "join", "missing code");
            return;
        }
        if !self.outboxes.contains_key(&session) {
            self.ignore(&session, "join", "unknown connection");
            return;
        }

        let previous = self.registry.join(session.clone(), code.clone(), role.clone());
        if let Some(prev) = previous.filter(|prev| prev.code != code) {
            tracing::info!(conn_id = %session, from = %prev.code, to = %code, "Connection moved rooms");
        }
        if role.is_host() && self.registry.hosts_in(&code) > 1 {
            tracing::warn!(code = %code, hosts = self.registry.hosts_in(&code), "Room has more than one host");
        }
        if !code.is_well_formed() {
            tracing::debug!(code = %code, "Joined room with non-standard code");
        }

        self.metrics.counter_inc(METRIC_JOINS, 1);
        self.metrics
            .gauge_set(METRIC_ROOMS, self.registry.room_count() as i64);

        let peers = self.registry.peers_of(&code, &session);
        tracing::info!(conn_id = %session, code = %code, role = %role, peers = peers.len(), "Joined room");
        self.deliver(&peers, &ServerEvent::PeerJoined { id: session, role });
    }

    fn select(&mut self, session: &ConnectionId, code: &PairingCode, key: Value) {
        // The sender only has to be joined somewhere, not to this code.
        if !self.registry.is_joined(session) {
            self.ignore(session, "select", "not joined");
            return;
        }
        let peers = self.registry.peers_of(code, session);
        let delivered = self.deliver(
            &peers,
            &ServerEvent::Select {
                key,
                from: session.clone(),
            },
        );
        tracing::debug!(conn_id = %session, code = %code, recipients = delivered, "Relayed select");
    }

    fn end_session(&mut self, session: &ConnectionId, code: &PairingCode) {
        if !self.registry.is_joined(session) {
            self.ignore(session, "end-session", "not joined");
            return;
        }
        // Advisory: members are told, connections stay open.
        let members = self.registry.members_of(code);
        let delivered = self.deliver(&members, &ServerEvent::SessionEnded { code: code.clone() });
        tracing::info!(conn_id = %session, code = %code, recipients = delivered, "Session ended");
    }

    fn disconnect(&mut self, session: &ConnectionId) {
        if self.outboxes.remove(session).is_some() {
            self.metrics.gauge_inc(METRIC_CONNECTIONS, -1);
        }

        let Some(membership) = self.registry.remove(session) else {
            tracing::debug!(conn_id = %session, "Disconnected before joining");
            return;
        };
        self.metrics
            .gauge_set(METRIC_ROOMS, self.registry.room_count() as i64);

        let remaining = self.registry.members_of(&membership.code);
        tracing::info!(
            conn_id = %session,
            code = %membership.code,
            role = %membership.role,
            remaining = remaining.len(),
            "Left room"
        );
        self.deliver(
            &remaining,
            &ServerEvent::PeerLeft {
                id: session.clone(),
                role: membership.role,
            },
        );
    }

    /// Fire-and-forget fan-out. Returns how many outboxes accepted the event.
    fn deliver(&self, recipients: &[ConnectionId], event: &ServerEvent) -> usize {
        if recipients.is_empty() {
            return 0;
        }
        let frame = match event.encode() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                tracing::error!(event = event.name(), error = %e, "Failed to encode event");
                return 0;
            }
        };

        let mut delivered = 0;
        for id in recipients {
            let Some(outbox) = self.outboxes.get(id) else {
                continue;
            };
            match outbox.try_send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.counter_inc(METRIC_DROPPED, 1);
                    tracing::warn!(conn_id = %id, event = event.name(), "Send queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.metrics.counter_inc(METRIC_DROPPED, 1);
                    tracing::debug!(conn_id = %id, event = event.name(), "Outbox closed, dropping message");
                }
            }
        }
        self.metrics.counter_inc(METRIC_RELAYED, delivered as u64);
        delivered
    }

    fn ignore(&self, session: &ConnectionId, event: &'static str, reason: &'static str) {
        self.metrics.counter_inc(METRIC_IGNORED, 1);
        tracing::debug!(conn_id = %session, event, reason, "Ignored message");
    }
}

/// Cloneable sender side of the engine's command channel.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Queue a command. Returns `false` once the engine has stopped.
    pub async fn send(&self, command: EngineCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    /// Ask the engine for a code no live room is using.
    pub async fn fresh_code(&self) -> Option<PairingCode> {
        let (reply, rx) = oneshot::channel();
        if !self.send(EngineCommand::FreshCode { reply }).await {
            return None;
        }
        rx.await.ok()
    }
}
