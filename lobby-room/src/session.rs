//! Session handles for connected participants.
//!
//! A [`Session`] is owned by the transport (one `Arc<Session>` per
//! connection). Everything else, groups included, refers to it through
//! `Weak` handles or by [`SessionId`].
//!
//! Outbound delivery never blocks: frames go onto a bounded queue drained by
//! the connection's writer task. A full queue or a gone writer is reported as
//! a [`SendError`] to the caller.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::ServerFrame;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier. Serialized as a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery to a single session failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("session channel closed")]
    Closed,
    #[error("session outbound queue full")]
    Backpressure,
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

/// Identity binding failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("illegal uid: {0}")]
    InvalidUid(u64),
}

/// One connected participant.
pub struct Session {
    id: SessionId,
    /// Bound application identity, 0 while unbound.
    uid: AtomicU64,
    outbound: mpsc::Sender<Arc<ServerFrame>>,
    closed: AtomicBool,
    remote_addr: Option<SocketAddr>,
}

impl Session {
    /// Create a session with a fresh id and its outbound receiver.
    ///
    /// `capacity` bounds the number of frames queued for the writer.
    pub fn open(
        capacity: usize,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<ServerFrame>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: SessionId::next(),
            uid: AtomicU64::new(0),
            outbound,
            closed: AtomicBool::new(false),
            remote_addr,
        });
        (session, rx)
    }

    /// Session without a remote address (in-process use and tests).
    pub fn pair(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<ServerFrame>>) {
        Self::open(capacity, None)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Bound identity, if any.
    pub fn uid(&self) -> Option<u64> {
        match self.uid.load(Ordering::Acquire) {
            0 => None,
            uid => Some(uid),
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Attach an application identity. Re-binding replaces the previous one.
    pub fn bind(&self, uid: u64) -> Result<(), SessionError> {
        if uid == 0 {
            return Err(SessionError::InvalidUid(uid));
        }
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.uid.store(uid, Ordering::Release);
        Ok(())
    }

    /// Push a named event to this session.
    pub fn push(&self, route: &str, body: &impl Serialize) -> Result<(), SendError> {
        let frame = ServerFrame::push(route, body).map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_frame(Arc::new(frame))
    }

    /// Reply to the request carrying `request_id`.
    pub fn respond(&self, request_id: u64, body: &impl Serialize) -> Result<(), SendError> {
        let frame =
            ServerFrame::response(request_id, body).map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_frame(Arc::new(frame))
    }

    /// Queue an already-built frame. Shared frames let a broadcast encode once.
    pub fn send_frame(&self, frame: Arc<ServerFrame>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Mark the session closed. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Callback run when a session closes.
pub type ClosedHook = Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Process-wide lifecycle hooks.
///
/// Hooks are global: every registered hook sees every closed session, so
/// hooks must tolerate sessions they never knew about.
#[derive(Clone, Default)]
pub struct SessionHooks {
    closed: Arc<RwLock<Vec<ClosedHook>>>,
}

impl SessionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for closed sessions.
    pub async fn on_closed<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: ClosedHook =
            Arc::new(move |session: Arc<Session>| -> BoxFuture<'static, ()> { Box::pin(hook(session)) });
        self.closed.write().await.push(hook);
    }

    /// Close `session` and run every closed hook, in registration order.
    ///
    /// Hooks run at most once per session; later calls return `false`.
    pub async fn dispatch_closed(&self, session: &Arc<Session>) -> bool {
        if !session.close() {
            return false;
        }
        let hooks: Vec<ClosedHook> = self.closed.read().await.clone();
        log::debug!("Session {} closed, running {} hooks", session.id(), hooks.len());
        for hook in hooks {
            hook(session.clone()).await;
        }
        true
    }

    pub async fn hook_count(&self) -> usize {
        self.closed.read().await.len()
    }
}
