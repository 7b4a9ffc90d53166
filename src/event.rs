//! Notifications delivered to room listeners.

use serde::Serialize;

use crate::room::RoomModel;

/// Why a room session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    /// The server announced `room_closed`.
    ServerClosed,
    /// The channel or transport went away.
    Disconnected(Option<String>),
}

/// One state change, as seen by a listener registered with
/// [`RoomSession::subscribe`](crate::RoomSession::subscribe).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomUpdate {
    /// The model changed; this is the new snapshot.
    Changed(RoomModel),
    /// The room is gone. This is the last update a listener receives; the
    /// caller is expected to call [`leave`](crate::RoomSession::leave).
    Closed {
        room_id: String,
        reason: CloseReason,
        /// Model as it was when the room closed.
        last: RoomModel,
    },
}

impl RoomUpdate {
    /// The model carried by this update.
    pub fn model(&self) -> &RoomModel {
        match self {
            Self::Changed(model) => model,
            Self::Closed { last, .. } => last,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}
