//! # lobby-room — group membership and broadcast for chat lobbies
//!
//! Sessions join a named [`Group`], receive the current membership, and get
//! every message published to the group until they leave or disconnect.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ LobbyClient │ ◄─────────────────► │ LobbyServer │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ one Session per connection
//!                                            ▼
//!                                     ┌─────────────┐
//!                                     │ Room        │ join / message / closed
//!                                     └──────┬──────┘
//!                                            ▼
//!                                     ┌─────────────┐
//!                                     │ Group       │ members + fan-out
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] — Session handles, identity binding, close hooks
//! - [`group`] — Membership set and best-effort broadcast
//! - [`room`] — Join / message orchestration over one group
//! - [`protocol`] — JSON wire frames and payloads
//! - [`server`] — WebSocket transport
//! - [`client`] — WebSocket client

pub mod protocol;
pub mod session;
pub mod group;
pub mod room;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    AllMembers, ClientFrame, JoinResponse, NewUser, ProtocolError, ServerFrame, UserMessage,
};
pub use session::{SendError, Session, SessionError, SessionHooks, SessionId};
pub use group::{AddError, Group, GroupStats};
pub use room::{Room, RoomError};
pub use server::{ConfigError, LobbyServer, ServerConfig, ServerStats};
pub use client::{ConnectionState, LobbyClient, RoomEvent};
