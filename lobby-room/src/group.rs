//! Named member set with best-effort fan-out.
//!
//! A [`Group`] tracks sessions by id and holds only `Weak` references, so it
//! never keeps a closed connection alive. Membership changes take the write
//! lock; snapshots and broadcasts take the read lock just long enough to copy
//! the member list, then deliver with no lock held.
//!
//! Delivery policy: each member is sent to independently. A member whose
//! send fails is logged and counted, never reported to the broadcaster.
//! Entries whose session has already been dropped are pruned after the
//! broadcast that discovers them.
//!
//! Capacity: membership is unbounded unless the caller passes a limit to
//! [`Group::try_add`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::protocol::{ProtocolError, ServerFrame};
use crate::session::{SendError, Session, SessionId};

/// Why [`Group::try_add`] refused a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddError {
    #[error("group is closed")]
    GroupClosed,
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
    #[error("group is full ({limit} members)")]
    Full { limit: usize },
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub broadcasts: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
    pub active_members: usize,
}

/// Lock-free counters updated on the broadcast path.
#[derive(Default)]
struct AtomicGroupStats {
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
}

/// A named set of sessions.
pub struct Group {
    name: String,
    members: RwLock<HashMap<SessionId, Weak<Session>>>,
    closed: AtomicBool,
    stats: AtomicGroupStats,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            stats: AtomicGroupStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a session. Returns `false` if it was already a member or was
    /// refused (see [`Group::try_add`]).
    pub async fn add(&self, session: &Arc<Session>) -> bool {
        matches!(self.try_add(session, None).await, Ok(true))
    }

    /// Add a session, optionally capped at `limit` members.
    ///
    /// `Ok(false)` means it was already a member. Every check runs under the
    /// write lock, so a closed session, a closed group or a full group can
    /// never slip in between check and insert.
    pub async fn try_add(&self, session: &Arc<Session>, limit: Option<usize>) -> Result<bool, AddError> {
        let id = session.id();
        let mut members = self.members.write().await;
        if self.closed.load(Ordering::Acquire) {
            log::warn!("Group {}: rejected session {id} (group closed)", self.name);
            return Err(AddError::GroupClosed);
        }
        if session.is_closed() {
            log::debug!("Group {}: rejected session {id} (session closed)", self.name);
            return Err(AddError::SessionClosed(id));
        }
        if members.contains_key(&id) {
            return Ok(false);
        }
        if let Some(limit) = limit {
            if members.len() >= limit {
                return Err(AddError::Full { limit });
            }
        }
        members.insert(id, Arc::downgrade(session));
        log::debug!("Group {}: session {id} added ({} members)", self.name, members.len());
        Ok(true)
    }

    /// Remove a session. Returns `false` if it was not a member.
    pub async fn leave(&self, id: SessionId) -> bool {
        let removed = self.members.write().await.remove(&id).is_some();
        if removed {
            log::debug!("Group {}: session {id} left", self.name);
        }
        removed
    }

    /// Point-in-time copy of the member ids, sorted ascending.
    pub async fn members(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.members.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    /// Current member count (diagnostics only).
    pub async fn count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Broadcast an event to every current member.
    ///
    /// Returns the number of members the event was queued for. The only
    /// error is a payload that cannot be encoded, detected before any send.
    pub async fn broadcast(&self, route: &str, body: &impl Serialize) -> Result<usize, ProtocolError> {
        let frame = Arc::new(ServerFrame::push(route, body)?);
        Ok(self.deliver(route, frame, None).await)
    }

    /// Broadcast to every current member except `excluded`.
    pub async fn broadcast_except(
        &self,
        route: &str,
        body: &impl Serialize,
        excluded: SessionId,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(ServerFrame::push(route, body)?);
        Ok(self.deliver(route, frame, Some(excluded)).await)
    }

    async fn deliver(&self, route: &str, frame: Arc<ServerFrame>, excluded: Option<SessionId>) -> usize {
        let targets: Vec<(SessionId, Weak<Session>)> = {
            let members = self.members.read().await;
            members
                .iter()
                .filter(|(id, _)| Some(**id) != excluded)
                .map(|(id, weak)| (*id, weak.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut failed = 0;
        let mut dead = Vec::new();
        for (id, weak) in targets {
            let result = match weak.upgrade() {
                Some(session) => session.send_frame(frame.clone()),
                None => {
                    dead.push(id);
                    Err(SendError::Closed)
                }
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    log::warn!("Group {}: {route} to session {id} failed: {e}", self.name);
                }
            }
        }

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats.failed_deliveries.fetch_add(failed, Ordering::Relaxed);

        if !dead.is_empty() {
            let mut members = self.members.write().await;
            for id in dead {
                // A re-join may have replaced the stale entry meanwhile.
                if members.get(&id).is_some_and(|w| w.strong_count() == 0) {
                    members.remove(&id);
                    log::debug!("Group {}: pruned dropped session {id}", self.name);
                }
            }
        }

        delivered
    }

    /// Evict every member and refuse further adds. Returns the evicted ids.
    pub async fn close(&self) -> Vec<SessionId> {
        let mut members = self.members.write().await;
        self.closed.store(true, Ordering::Release);
        let mut evicted: Vec<SessionId> = members.drain().map(|(id, _)| id).collect();
        evicted.sort_unstable();
        log::info!("Group {} closed, evicted {} members", self.name, evicted.len());
        evicted
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Broadcast statistics.
    pub async fn stats(&self) -> GroupStats {
        GroupStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.stats.failed_deliveries.load(Ordering::Relaxed),
            active_members: self.count().await,
        }
    }
}
