//! # RPS Room Client
//!
//! Transport-agnostic Rust client for server-authoritative rock-paper-scissors
//! rooms.
//!
//! A [`RoomSession`] joins one room's channel topic, consumes the server's
//! push stream of presence and round events, and keeps a reconciled
//! [`RoomModel`]: who is present, what state the round is in, who has
//! committed a move, and who won. The player can ask to start a round (owner
//! only) and commit a move; the server's echoes are what change the model.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement the [`Transport`] trait for any backend
//! - **Phoenix channels wire format**: v2 JSON frames, join handshake, heartbeats
//! - **WebSocket built-in**: default `transport-websocket` feature provides `WebSocketTransport`
//! - **Observer API**: any number of listeners receive a [`RoomUpdate`] per transition
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rps_room_client::{RoomInfo, RoomSession, RoomUpdate, SessionConfig, WebSocketTransport};
//!
//! let info = RoomInfo::new("R1", "alice", true);
//! let url = info.socket_url("ws://localhost:4000/socket/websocket");
//! let transport = WebSocketTransport::connect(&url).await?;
//! let session = RoomSession::join(transport, info, SessionConfig::default()).await?;
//!
//! session.subscribe(|update| println!("{update:?}"));
//! session.request_start()?;
//! ```

pub mod channel;
pub mod error;
pub mod event;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use channel::{ChannelConfig, SessionChannel};
pub use error::{JoinError, RoomError};
pub use event::{CloseReason, RoomUpdate};
pub use presence::{PhoenixPresence, PresenceReconciler};
pub use protocol::{ClientAction, EventName, JoinAck, RoomInfo, ServerEvent};
pub use room::{
    Identity, Member, Membership, MoveSet, PlayerRoundStatus, RoomModel, RoundState,
};
pub use session::{ListenerId, RoomSession, SessionConfig};
pub use transport::Transport;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
