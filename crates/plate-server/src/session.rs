use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use plate_core::{ClientMessage, ConnectionId, PairingCode, ProtocolError, Role};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineCommand, EngineHandle};

/// Transport settings for a single connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

/// Where a connection is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Joined { code: PairingCode, role: Role },
    Terminated,
}

/// Per-connection bookkeeping, owned by the connection task.
///
/// Turns decoded frames into engine commands. `select` and `end-session`
/// only pass once the connection has joined; a join without a code is
/// dropped. Nothing here answers the peer.
#[derive(Debug)]
pub struct ConnectionSession {
    id: ConnectionId,
    state: SessionState,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: SessionState::Connected,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn code(&self) -> Option<&PairingCode> {
        match &self.state {
            SessionState::Joined { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<&Role> {
        match &self.state {
            SessionState::Joined { role, .. } => Some(role),
            _ => None,
        }
    }

    /// Apply an inbound message. `None` means the message is dropped.
    pub fn on_message(&mut self, message: ClientMessage) -> Option<EngineCommand> {
        if self.state == SessionState::Terminated {
            return None;
        }
        let joined = matches!(self.state, SessionState::Joined { .. });

        match message {
            ClientMessage::Join(req) => {
                let code = req.code?;
                self.state = SessionState::Joined {
                    code: code.clone(),
                    role: req.role.clone(),
                };
                Some(EngineCommand::Join {
                    session: self.id.clone(),
                    code,
                    role: req.role,
                })
            }
            ClientMessage::Select(req) if joined => Some(EngineCommand::Select {
                session: self.id.clone(),
                code: req.code?,
                key: req.key,
            }),
            ClientMessage::EndSession(req) if joined => Some(EngineCommand::EndSession {
                session: self.id.clone(),
                code: req.code?,
            }),
            ClientMessage::Select(_) | ClientMessage::EndSession(_) => None,
        }
    }

    /// Transport closed. Yields the disconnect command exactly once.
    pub fn on_disconnect(&mut self) -> Option<EngineCommand> {
        if self.state == SessionState::Terminated {
            return None;
        }
        self.state = SessionState::Terminated;
        Some(EngineCommand::Disconnect {
            session: self.id.clone(),
        })
    }
}

/// Last time the peer showed signs of life.
struct Liveness {
    origin: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_seen_ms.store(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Drive one WebSocket connection from accept to close.
///
/// Registers an outbox with the engine, forwards inbound frames in arrival
/// order, and sends exactly one disconnect when the socket goes away for any
/// reason (close frame, read error, heartbeat timeout, shutdown).
pub async fn run_connection(
    socket: WebSocket,
    id: ConnectionId,
    engine: EngineHandle,
    config: ConnectionConfig,
    shutdown: CancellationToken,
) {
    let (outbox, rx) = mpsc::channel(config.max_send_queue);
    if !engine
        .send(EngineCommand::Connect {
            session: id.clone(),
            outbox,
        })
        .await
    {
        tracing::warn!("Relay engine unavailable, dropping connection");
        return;
    }
    tracing::info!("Connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let liveness = Arc::new(Liveness::new());
    let mut session = ConnectionSession::new(id);

    let mut writer = tokio::spawn(write_loop(ws_tx, rx, Arc::clone(&liveness), config));

    tokio::select! {
        _ = &mut writer => {},
        () = read_loop(&mut ws_rx, &mut session, &engine, &liveness) => {},
        () = shutdown.cancelled() => {},
    }
    writer.abort();

    if let Some(command) = session.on_disconnect() {
        engine.send(command).await;
    }
    tracing::info!("Disconnected");
}

async fn read_loop(
    ws_rx: &mut SplitStream<WebSocket>,
    session: &mut ConnectionSession,
    engine: &EngineHandle,
    liveness: &Liveness,
) {
    while let Some(Ok(msg)) = ws_rx.next().await {
        liveness.touch();
        let decoded = match msg {
            WsMessage::Text(text) => ClientMessage::decode(text.as_str()),
            WsMessage::Binary(_) => Err(ProtocolError::Binary),
            WsMessage::Close(_) => break,
            // axum answers pings itself
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(kind = e.error_kind(), error = %e, "Dropping unexpected payload");
                continue;
            }
        };

        let name = message.name();
        match session.on_message(message) {
            Some(command) => {
                if !engine.send(command).await {
                    break;
                }
            }
            None => tracing::debug!(event = name, state = ?session.state(), "Ignored message"),
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Arc<String>>,
    liveness: Arc<Liveness>,
    config: ConnectionConfig,
) {
    let mut ping_interval = tokio::time::interval(config.heartbeat_interval);
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(String::clone(&text).into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if liveness.idle() > config.client_timeout {
                    tracing::info!(idle_secs = liveness.idle().as_secs(), "Heartbeat timeout");
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                tracing::trace!("Sent ping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plate_core::{EndSessionRequest, JoinRequest, SelectRequest};
    use serde_json::json;

    fn session() -> ConnectionSession {
        ConnectionSession::new(ConnectionId::from_raw("conn_a"))
    }

    fn join(code: Option<&str>, role: Role) -> ClientMessage {
        ClientMessage::Join(JoinRequest {
            code: code.map(PairingCode::from),
            role,
        })
    }

    fn select(code: &str) -> ClientMessage {
        ClientMessage::Select(SelectRequest {
            code: Some(code.into()),
            key: json!("7"),
        })
    }

    #[test]
    fn starts_connected() {
        let s = session();
        assert_eq!(s.state(), &SessionState::Connected);
        assert!(s.code().is_none());
        assert!(s.role().is_none());
    }

    #[test]
    fn select_before_join_is_dropped() {
        let mut s = session();
        assert!(s.on_message(select("4821")).is_none());
        let end = ClientMessage::EndSession(EndSessionRequest {
            code: Some("4821".into()),
        });
        assert!(s.on_message(end).is_none());
        assert_eq!(s.state(), &SessionState::Connected);
    }

    #[test]
    fn join_without_code_is_dropped() {
        let mut s = session();
        assert!(s.on_message(join(None, Role::Host)).is_none());
        assert_eq!(s.state(), &SessionState::Connected);
    }

    #[test]
    fn join_binds_and_forwards() {
        let mut s = session();
        let cmd = s.on_message(join(Some("4821"), Role::Host)).unwrap();
        assert!(matches!(
            cmd,
            EngineCommand::Join { ref code, role: Role::Host, .. } if code.as_str() == "4821"
        ));
        assert_eq!(s.code().map(PairingCode::as_str), Some("4821"));
        assert_eq!(s.role(), Some(&Role::Host));

        let cmd = s.on_message(select("4821")).unwrap();
        assert!(matches!(cmd, EngineCommand::Select { ref key, .. } if key == &json!("7")));
    }

    #[test]
    fn rejoin_rebinds() {
        let mut s = session();
        s.on_message(join(Some("1111"), Role::Client));
        s.on_message(join(Some("2222"), Role::Other("tv".into())));
        assert_eq!(
            s.state(),
            &SessionState::Joined {
                code: "2222".into(),
                role: Role::Other("tv".into())
            }
        );
    }

    #[test]
    fn joined_select_without_code_is_dropped() {
        let mut s = session();
        s.on_message(join(Some("1111"), Role::Client));
        let msg = ClientMessage::Select(SelectRequest {
            code: None,
            key: json!(1),
        });
        assert!(s.on_message(msg).is_none());
    }

    #[test]
    fn disconnect_fires_once() {
        let mut s = session();
        s.on_message(join(Some("1111"), Role::Client));
        assert!(matches!(s.on_disconnect(), Some(EngineCommand::Disconnect { .. })));
        assert!(s.on_disconnect().is_none());
        assert!(s.on_message(select("1111")).is_none());
        assert_eq!(s.state(), &SessionState::Terminated);
    }

    #[test]
    fn liveness_reports_idle_time() {
        let live = Liveness::new();
        live.touch();
        assert!(live.idle() < Duration::from_secs(1));
    }
}
