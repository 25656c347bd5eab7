//! WebSocket server hosting one chat room.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── Session A ──┐
//!             ├── accept + upgrade ──┤               ├── Room ── Group
//! Client B ──┘                       └── Session B ──┘
//!                                          ▲
//!                         outbound queue ──┘ (drained by the connection task)
//! ```
//!
//! Each connection runs in its own task, selecting over inbound frames, the
//! session's outbound queue and a heartbeat timer. When the connection ends
//! for any reason the session is closed through [`SessionHooks`], which
//! removes it from the room.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    from_body, ClientFrame, JoinResponse, ProtocolError, ServerFrame, UserMessage, CODE_BAD_REQUEST,
    CODE_UNKNOWN_ROUTE, ON_ERROR, ROUTE_JOIN, ROUTE_MESSAGE,
};
use crate::room::{Room, RoomError, DEFAULT_ROOM};
use crate::session::{Session, SessionHooks};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path accepted for the WebSocket upgrade
    pub ws_path: String,
    /// Name of the hosted room
    pub room_name: String,
    /// Frames buffered per session before sends fail with backpressure
    pub outbound_capacity: usize,
    /// Server heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Member limit (None = unbounded)
    pub max_members: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3250".to_string(),
            ws_path: "/ws".to_string(),
            room_name: DEFAULT_ROOM.to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            max_members: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl ServerConfig {
    /// Defaults overridden by `LOBBY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = lookup("LOBBY_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("LOBBY_WS_PATH") {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid { key: "LOBBY_WS_PATH", value: path });
            }
            config.ws_path = path;
        }
        if let Some(room) = lookup("LOBBY_ROOM") {
            if room.trim().is_empty() {
                return Err(ConfigError::Invalid { key: "LOBBY_ROOM", value: room });
            }
            config.room_name = room;
        }
        if let Some(value) = lookup("LOBBY_OUTBOUND_CAPACITY") {
            config.outbound_capacity = parse_positive("LOBBY_OUTBOUND_CAPACITY", value)?;
        }
        if let Some(value) = lookup("LOBBY_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = parse_positive("LOBBY_HEARTBEAT_SECS", value)? as u64;
        }
        if let Some(value) = lookup("LOBBY_MAX_MEMBERS") {
            config.max_members = Some(parse_positive("LOBBY_MAX_MEMBERS", value)?);
        }
        Ok(config)
    }
}

fn parse_positive(key: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
}

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The lobby server.
pub struct LobbyServer {
    config: ServerConfig,
    room: Arc<Room>,
    hooks: SessionHooks,
    stats: Arc<AtomicServerStats>,
}

impl LobbyServer {
    /// Create a server and register the room's disconnect hook.
    pub async fn new(config: ServerConfig) -> Self {
        let hooks = SessionHooks::new();
        let room = Arc::new(Room::new(config.room_name.clone()).with_max_members(config.max_members));
        room.after_init(&hooks).await;
        Self {
            config,
            room,
            hooks,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub async fn with_defaults() -> Self {
        Self::new(ServerConfig::default()).await
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!(
            "Lobby server listening on {} (room {:?})",
            listener.local_addr()?,
            self.config.room_name
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let room = self.room.clone();
            let hooks = self.hooks.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, room, hooks, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        room: Arc<Room>,
        hooks: SessionHooks,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> ConnectionResult {
        let ws_path = config.ws_path.as_str();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            if req.uri().path() == ws_path {
                return Ok(resp);
            }
            log::debug!("Rejecting upgrade from {addr} on {}", req.uri().path());
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (session, mut outbound) = Session::open(config.outbound_capacity, Some(addr));
        log::info!("WebSocket connection established from {addr} (session {})", session.id());

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result: ConnectionResult = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                stats.total_frames.fetch_add(1, Ordering::Relaxed);
                                match ClientFrame::decode(text.as_str()) {
                                    Ok(frame) => dispatch(&room, &session, frame).await,
                                    Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                log::warn!("Ignoring binary frame from {addr}");
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    frame = outbound.recv() => {
                        match frame {
                            Some(frame) => {
                                ws_sender.send(Message::Text(frame.encode()?.into())).await?;
                            }
                            None => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Text(ServerFrame::Heartbeat.encode()?.into())).await?;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Runs on every exit path, errors included.
        hooks.dispatch_closed(&session).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        result
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_frames: self.stats.total_frames.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn hooks(&self) -> &SessionHooks {
        &self.hooks
    }
}

/// Route one decoded client frame to the room.
pub async fn dispatch(room: &Room, session: &Arc<Session>, frame: ClientFrame) {
    let id = session.id();
    match frame {
        ClientFrame::Request { id: request_id, route, body } => match route.as_str() {
            ROUTE_JOIN => {
                if let Err(e) = room.join(session, request_id).await {
                    log::warn!("Session {id}: join failed: {e}");
                }
            }
            ROUTE_MESSAGE => match from_body::<UserMessage>(&body) {
                Ok(msg) => match room.message(session, Some(request_id), &msg).await {
                    Ok(_) => reply(session, request_id, &JoinResponse::success()),
                    // Already answered by the room
                    Err(RoomError::NotJoined(_)) => {}
                    Err(e) => log::warn!("Session {id}: message failed: {e}"),
                },
                Err(e) => reply(session, request_id, &JoinResponse::failure(CODE_BAD_REQUEST, e.to_string())),
            },
            other => {
                let err = ProtocolError::UnknownRoute(other.to_string());
                log::debug!("Session {id}: {err}");
                reply(session, request_id, &JoinResponse::failure(CODE_UNKNOWN_ROUTE, err.to_string()));
            }
        },
        ClientFrame::Notify { route, body } => match route.as_str() {
            ROUTE_MESSAGE => match from_body::<UserMessage>(&body) {
                Ok(msg) => {
                    if let Err(e) = room.message(session, None, &msg).await {
                        log::debug!("Session {id}: message rejected: {e}");
                    }
                }
                Err(e) => {
                    if let Err(send) = session.push(ON_ERROR, &JoinResponse::failure(CODE_BAD_REQUEST, e.to_string())) {
                        log::debug!("Session {id}: error push not delivered: {send}");
                    }
                }
            },
            other => log::debug!("Session {id}: ignoring notify on {other:?}"),
        },
        ClientFrame::Heartbeat => {
            if let Err(e) = session.send_frame(Arc::new(ServerFrame::Heartbeat)) {
                log::debug!("Session {id}: heartbeat reply not delivered: {e}");
            }
        }
    }
}

fn reply(session: &Session, request_id: u64, body: &JoinResponse) {
    if let Err(e) = session.respond(request_id, body) {
        log::debug!("Session {}: response not delivered: {e}", session.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CODE_NOT_JOINED, ON_MEMBERS, ON_MESSAGE};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<Arc<ServerFrame>>) -> Vec<Arc<ServerFrame>> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn request(id: u64, route: &str, body: serde_json::Value) -> ClientFrame {
        ClientFrame::Request {
            id,
            route: route.to_string(),
            body,
        }
    }

    fn response_body(frames: &[Arc<ServerFrame>], request_id: u64) -> JoinResponse {
        frames
            .iter()
            .find_map(|f| match f.as_ref() {
                ServerFrame::Response { id, .. } if *id == request_id => Some(f.body_as().unwrap()),
                _ => None,
            })
            .expect("response frame")
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:3250");
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.room_name, "room");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.max_members.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("LOBBY_BIND_ADDR", "127.0.0.1:8080"),
            ("LOBBY_WS_PATH", "/chat"),
            ("LOBBY_ROOM", "lobby"),
            ("LOBBY_OUTBOUND_CAPACITY", "64"),
            ("LOBBY_HEARTBEAT_SECS", "5"),
            ("LOBBY_MAX_MEMBERS", "10"),
        ]);
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(
            config,
            ServerConfig {
                bind_addr: "127.0.0.1:8080".to_string(),
                ws_path: "/chat".to_string(),
                room_name: "lobby".to_string(),
                outbound_capacity: 64,
                heartbeat_interval_secs: 5,
                max_members: Some(10),
            }
        );
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let err = ServerConfig::from_lookup(|k| (k == "LOBBY_OUTBOUND_CAPACITY").then(|| "0".to_string())).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "LOBBY_OUTBOUND_CAPACITY",
                value: "0".to_string()
            }
        );
        assert!(ServerConfig::from_lookup(|k| (k == "LOBBY_MAX_MEMBERS").then(|| "many".to_string())).is_err());
        assert!(ServerConfig::from_lookup(|k| (k == "LOBBY_ROOM").then(|| " ".to_string())).is_err());
        assert_eq!(
            ServerConfig::from_lookup(|k| (k == "LOBBY_WS_PATH").then(|| "ws".to_string())).unwrap_err(),
            ConfigError::Invalid {
                key: "LOBBY_WS_PATH",
                value: "ws".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = LobbyServer::with_defaults().await;
        assert_eq!(server.config().bind_addr, "0.0.0.0:3250");
        assert_eq!(server.room().group().name(), "room");
        assert_eq!(server.hooks().hook_count().await, 1);
        assert_eq!(server.stats(), ServerStats::default());
    }

    #[tokio::test]
    async fn test_dispatch_join_and_message_request() {
        let room = Room::new("room");
        let (session, mut rx) = Session::pair(16);

        dispatch(&room, &session, request(1, ROUTE_JOIN, json!({}))).await;
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.route() == Some(ON_MEMBERS)));
        assert!(response_body(&frames, 1).is_success());

        dispatch(&room, &session, request(2, ROUTE_MESSAGE, json!({"name": "a", "content": "hi"}))).await;
        let frames = drain(&mut rx);
        let echoed: UserMessage = frames.iter().find(|f| f.route() == Some(ON_MESSAGE)).unwrap().body_as().unwrap();
        assert_eq!(echoed.content, "hi");
        assert!(response_body(&frames, 2).is_success());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_route() {
        let room = Room::new("room");
        let (session, mut rx) = Session::pair(16);

        dispatch(&room, &session, request(9, "room.kick", json!({}))).await;
        let resp = response_body(&drain(&mut rx), 9);
        assert_eq!(resp.code, CODE_UNKNOWN_ROUTE);
        assert_eq!(resp.result, "Unknown route: room.kick");

        // Unknown notify is dropped silently
        dispatch(&room, &session, ClientFrame::Notify { route: "room.kick".into(), body: json!({}) }).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_bad_message_body() {
        let room = Room::new("room");
        let (session, mut rx) = Session::pair(16);
        dispatch(&room, &session, request(1, ROUTE_JOIN, json!({}))).await;
        drain(&mut rx);

        dispatch(&room, &session, request(2, ROUTE_MESSAGE, json!({"content": 5}))).await;
        assert_eq!(response_body(&drain(&mut rx), 2).code, CODE_BAD_REQUEST);

        dispatch(&room, &session, ClientFrame::Notify { route: ROUTE_MESSAGE.into(), body: json!(null) }).await;
        let frames = drain(&mut rx);
        let err: JoinResponse = frames[0].body_as().unwrap();
        assert_eq!(frames[0].route(), Some(ON_ERROR));
        assert_eq!(err.code, CODE_BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dispatch_message_before_join() {
        let room = Room::new("room");
        let (session, mut rx) = Session::pair(16);

        dispatch(&room, &session, request(4, ROUTE_MESSAGE, json!({"name": "a", "content": "hi"}))).await;
        let frames = drain(&mut rx);
        // Exactly one reply, the rejection
        assert_eq!(frames.len(), 1);
        assert_eq!(response_body(&frames, 4).code, CODE_NOT_JOINED);
    }

    #[tokio::test]
    async fn test_dispatch_heartbeat() {
        let room = Room::new("room");
        let (session, mut rx) = Session::pair(16);
        dispatch(&room, &session, ClientFrame::Heartbeat).await;
        assert_eq!(drain(&mut rx), vec![Arc::new(ServerFrame::Heartbeat)]);
    }

    #[tokio::test]
    async fn test_dispatch_join_as_notify_ignored() {
        let room = Room::new("room");
        let (session, mut rx) = Session::pair(16);
        dispatch(&room, &session, ClientFrame::Notify { route: ROUTE_JOIN.into(), body: json!({}) }).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(room.group().count().await, 0);
    }
}
