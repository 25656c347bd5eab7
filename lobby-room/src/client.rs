//! WebSocket client for the lobby server.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Correlated requests (`join` waits for its response)
//! - Chat notifications
//! - A stream of [`RoomEvent`]s decoded from server pushes

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    AllMembers, ClientFrame, JoinResponse, NewUser, ProtocolError, ServerFrame, UserMessage,
    ON_ERROR, ON_MEMBERS, ON_MESSAGE, ON_NEW_USER, ROUTE_JOIN, ROUTE_MESSAGE,
};
use crate::session::SessionId;

/// How long a request waits for its response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Members present when we joined
    Members(Vec<SessionId>),
    /// Someone joined after us
    NewUser(String),
    /// Chat message, including our own echo
    Message(UserMessage),
    /// An action of ours was rejected
    Error(JoinResponse),
    /// Connection lost
    Disconnected,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// The lobby client.
pub struct LobbyClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    next_request_id: AtomicU64,
    pending: Pending,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<RoomEvent>>,
    event_tx: mpsc::Sender<RoomEvent>,
}

impl LobbyClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_request_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RoomEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket, close when the
        // channel is dropped.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;

        // Reader task: resolve responses, turn pushes into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerFrame::decode(text.as_str()) {
                        Ok(ServerFrame::Response { id, body }) => {
                            if let Some(waiter) = pending.lock().await.remove(&id) {
                                let _ = waiter.send(body);
                            }
                        }
                        Ok(frame @ ServerFrame::Push { .. }) => {
                            if let Some(event) = push_event(&frame) {
                                let _ = event_tx.send(event).await;
                            }
                        }
                        Ok(ServerFrame::Heartbeat) => {}
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail outstanding requests.
            pending.lock().await.clear();
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RoomEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Join the room and wait for the server's verdict.
    pub async fn join(&self) -> Result<JoinResponse, ProtocolError> {
        let body = self.request(ROUTE_JOIN, &serde_json::json!({})).await?;
        serde_json::from_value(body).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Send a chat message without waiting for a reply.
    pub async fn send_message(&self, name: &str, content: &str) -> Result<(), ProtocolError> {
        let msg = UserMessage {
            name: name.to_string(),
            content: content.to_string(),
        };
        self.send(ClientFrame::notify(ROUTE_MESSAGE, &msg)?).await
    }

    /// Send a request and wait for the correlated response body.
    pub async fn request(&self, route: &str, body: &impl Serialize) -> Result<Value, ProtocolError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.send(ClientFrame::request(id, route, body)?).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    pub async fn send_heartbeat(&self) -> Result<(), ProtocolError> {
        self.send(ClientFrame::Heartbeat).await
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(frame.encode()?).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. The server sees a normal close.
    pub fn close(&mut self) {
        self.outgoing_tx = None;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn push_event(frame: &ServerFrame) -> Option<RoomEvent> {
    let route = frame.route()?;
    let event = match route {
        ON_MEMBERS => frame.body_as::<AllMembers>().map(|m| RoomEvent::Members(m.members)),
        ON_NEW_USER => frame.body_as::<NewUser>().map(|u| RoomEvent::NewUser(u.content)),
        ON_MESSAGE => frame.body_as::<UserMessage>().map(RoomEvent::Message),
        ON_ERROR => frame.body_as::<JoinResponse>().map(RoomEvent::Error),
        other => {
            log::debug!("Ignoring push on {other:?}");
            return None;
        }
    };
    event
        .map_err(|e| log::warn!("Malformed {route} push: {e}"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CODE_NOT_JOINED;

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = LobbyClient::new("ws://127.0.0.1:3250/ws");
        assert_eq!(client.server_url(), "ws://127.0.0.1:3250/ws");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = LobbyClient::new("ws://127.0.0.1:3250/ws");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let client = LobbyClient::new("ws://127.0.0.1:3250/ws");
        assert_eq!(client.send_message("a", "b").await, Err(ProtocolError::ConnectionClosed));
        assert_eq!(client.join().await, Err(ProtocolError::ConnectionClosed));
        assert!(client.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // Port 9 (discard) is not a WebSocket server
        let mut client = LobbyClient::new("ws://127.0.0.1:9");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_push_events() {
        let members = ServerFrame::push(ON_MEMBERS, &AllMembers { members: vec![SessionId(3)] }).unwrap();
        assert_eq!(push_event(&members), Some(RoomEvent::Members(vec![SessionId(3)])));

        let new_user = ServerFrame::push(ON_NEW_USER, &NewUser::announce(SessionId(4))).unwrap();
        assert_eq!(push_event(&new_user), Some(RoomEvent::NewUser("New user: 4".into())));

        let rejection = JoinResponse::failure(CODE_NOT_JOINED, "not joined");
        let error = ServerFrame::push(ON_ERROR, &rejection).unwrap();
        assert_eq!(push_event(&error), Some(RoomEvent::Error(rejection)));

        let unknown = ServerFrame::push("onSomething", &()).unwrap();
        assert_eq!(push_event(&unknown), None);

        let malformed = ServerFrame::push(ON_MESSAGE, &"text").unwrap();
        assert_eq!(push_event(&malformed), None);
    }
}
