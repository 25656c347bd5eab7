//! Chat room handler: join, message, and disconnect cleanup over one [`Group`].
//!
//! Join order is fixed: bind → snapshot → announce → add → reply. The
//! snapshot is taken before the joiner is added, so a new member's
//! `onMembers` lists only the members that were already present and its own
//! `onNewUser` goes only to them.
//!
//! Chat messages are echoed back to the sender along with everyone else.

use std::sync::Arc;

use thiserror::Error;

use crate::group::{AddError, Group};
use crate::protocol::{
    AllMembers, JoinResponse, NewUser, ProtocolError, UserMessage, CODE_JOIN_FAILED,
    CODE_NOT_JOINED, CODE_ROOM_FULL, ON_ERROR, ON_MEMBERS, ON_MESSAGE, ON_NEW_USER,
};
use crate::session::{SendError, Session, SessionError, SessionHooks, SessionId};

/// Default group name of a room.
pub const DEFAULT_ROOM: &str = "room";

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("session {0} has not joined the room")]
    NotJoined(SessionId),
    #[error("bind failed: {0}")]
    Bind(#[from] SessionError),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("room is full ({limit} members)")]
    Full { limit: usize },
    #[error("room is closed")]
    Closed,
    #[error("session {0} closed before joining")]
    SessionClosed(SessionId),
}

/// A chat room backed by a single group.
pub struct Room {
    group: Arc<Group>,
    max_members: Option<usize>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_group(Arc::new(Group::new(name)))
    }

    pub fn with_group(group: Arc<Group>) -> Self {
        Self {
            group,
            max_members: None,
        }
    }

    /// Cap the number of members. `None` means unbounded.
    pub fn with_max_members(mut self, limit: Option<usize>) -> Self {
        self.max_members = limit;
        self
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// Register disconnect cleanup. Call once per room.
    ///
    /// The hook fires for every closed session in the process; `leave` is a
    /// no-op for sessions that never joined this room.
    pub async fn after_init(&self, hooks: &SessionHooks) {
        let group = self.group.clone();
        hooks
            .on_closed(move |session: Arc<Session>| {
                let group = group.clone();
                async move {
                    if group.leave(session.id()).await {
                        log::info!("Session {} left {} (disconnected)", session.id(), group.name());
                    }
                }
            })
            .await;
    }

    /// Join `session` to the room, replying to `request_id`.
    ///
    /// A failed step is not rolled back: members may already have been
    /// notified when the final reply fails.
    pub async fn join(&self, session: &Arc<Session>, request_id: u64) -> Result<(), RoomError> {
        let id = session.id();

        if self.group.is_closed() {
            reject_join(session, request_id, CODE_JOIN_FAILED, "room closed");
            return Err(RoomError::Closed);
        }

        if let Err(e) = session.bind(id.0) {
            log::warn!("Session {id} failed to bind: {e}");
            reject_join(session, request_id, CODE_JOIN_FAILED, e.to_string());
            return Err(e.into());
        }

        let rejoin = self.group.contains(id).await;
        if !rejoin {
            // Early out only; the insert below re-checks under the group lock.
            if let Some(limit) = self.max_members {
                if self.group.count().await >= limit {
                    reject_join(session, request_id, CODE_ROOM_FULL, "room is full");
                    return Err(RoomError::Full { limit });
                }
            }
        }

        // Snapshot before add; a re-joining member is not its own peer.
        let members: Vec<SessionId> = self
            .group
            .members()
            .await
            .into_iter()
            .filter(|member| *member != id)
            .collect();
        if let Err(e) = session.push(ON_MEMBERS, &AllMembers { members }) {
            log::warn!("Session {id}: member list not delivered: {e}");
            reject_join(session, request_id, CODE_JOIN_FAILED, e.to_string());
            return Err(e.into());
        }

        if !rejoin {
            self.group.broadcast(ON_NEW_USER, &NewUser::announce(id)).await?;
        }

        // Racing joiners may all pass the early limit check and announce
        // themselves; only the ones that fit are added here.
        match self.group.try_add(session, self.max_members).await {
            Ok(_) => {}
            Err(AddError::Full { limit }) => {
                reject_join(session, request_id, CODE_ROOM_FULL, "room is full");
                return Err(RoomError::Full { limit });
            }
            Err(AddError::GroupClosed) => {
                reject_join(session, request_id, CODE_JOIN_FAILED, "room closed");
                return Err(RoomError::Closed);
            }
            Err(AddError::SessionClosed(_)) => {
                reject_join(session, request_id, CODE_JOIN_FAILED, "session closed");
                return Err(RoomError::SessionClosed(id));
            }
        }
        session.respond(request_id, &JoinResponse::success())?;

        match session.remote_addr() {
            Some(addr) => log::info!(
                "Session {id} ({addr}) joined {} ({} members)",
                self.group.name(),
                self.group.count().await
            ),
            None => log::info!("Session {id} joined {} ({} members)", self.group.name(), self.group.count().await),
        }
        Ok(())
    }

    /// Broadcast a chat message from `session` to the whole room.
    ///
    /// Non-members are rejected with a `403` status: as the reply to
    /// `request_id` when the message came as a request, otherwise as an
    /// `onError` push. Returns the number of members reached.
    pub async fn message(
        &self,
        session: &Arc<Session>,
        request_id: Option<u64>,
        msg: &UserMessage,
    ) -> Result<usize, RoomError> {
        let id = session.id();
        if !self.group.contains(id).await {
            log::warn!("Session {id} sent a message without joining {}", self.group.name());
            let rejection = JoinResponse::failure(CODE_NOT_JOINED, "not joined");
            let sent = match request_id {
                Some(rid) => session.respond(rid, &rejection),
                None => session.push(ON_ERROR, &rejection),
            };
            if let Err(e) = sent {
                log::debug!("Session {id}: rejection not delivered: {e}");
            }
            return Err(RoomError::NotJoined(id));
        }

        let reached = self.group.broadcast(ON_MESSAGE, msg).await?;
        log::trace!("Session {id} message reached {reached} members");
        Ok(reached)
    }
}

fn reject_join(session: &Session, request_id: u64, code: i32, reason: impl Into<String>) {
    if let Err(e) = session.respond(request_id, &JoinResponse::failure(code, reason)) {
        log::debug!("Session {}: join rejection not delivered: {e}", session.id());
    }
}
