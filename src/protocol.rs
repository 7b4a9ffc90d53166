//! Wire types for the room channel.
//!
//! The server speaks the Phoenix channels v2 JSON serializer: every text frame
//! is a five-element array `[join_ref, ref, topic, event, payload]`. [`Frame`]
//! is that array with named fields. Room events are decoded from a frame's
//! `(event, payload)` pair into [`ServerEvent`]; player actions are encoded
//! from [`ClientAction`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Control event names ─────────────────────────────────────────────

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_CLOSE: &str = "phx_close";
pub const PHX_ERROR: &str = "phx_error";
pub const HEARTBEAT: &str = "heartbeat";

/// Topic used for socket-level heartbeats.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Prefix of outbound action names on servers that use `rps_play` and
/// `rps_start_game`.
pub const LEGACY_ACTION_PREFIX: &str = "rps_";

/// Serializer version advertised in the socket URL.
pub const SERIALIZER_VSN: &str = "2.0.0";

// ── Frame ───────────────────────────────────────────────────────────

type RawFrame = (
    Option<String>,
    Option<String>,
    String,
    String,
    serde_json::Value,
);

/// One channel message.
///
/// ```
/// use rps_room_client::protocol::Frame;
///
/// let frame: Frame =
///     serde_json::from_str(r#"["1","1","rps_room:R1","phx_join",{}]"#).unwrap();
/// assert_eq!(frame.topic, "rps_room:R1");
/// assert_eq!(frame.msg_ref.as_deref(), Some("1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawFrame", into = "RawFrame")]
pub struct Frame {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl From<RawFrame> for Frame {
    fn from((join_ref, msg_ref, topic, event, payload): RawFrame) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        }
    }
}

impl From<Frame> for RawFrame {
    fn from(frame: Frame) -> Self {
        (
            frame.join_ref,
            frame.msg_ref,
            frame.topic,
            frame.event,
            frame.payload,
        )
    }
}

impl Frame {
    /// `phx_join` for `topic`. The join ref doubles as the message ref.
    pub fn join(topic: impl Into<String>, join_ref: impl Into<String>) -> Self {
        let join_ref = join_ref.into();
        Self {
            join_ref: Some(join_ref.clone()),
            msg_ref: Some(join_ref),
            topic: topic.into(),
            event: PHX_JOIN.into(),
            payload: serde_json::json!({}),
        }
    }

    pub fn leave(
        topic: impl Into<String>,
        join_ref: impl Into<String>,
        msg_ref: impl Into<String>,
    ) -> Self {
        Self {
            join_ref: Some(join_ref.into()),
            msg_ref: Some(msg_ref.into()),
            topic: topic.into(),
            event: PHX_LEAVE.into(),
            payload: serde_json::json!({}),
        }
    }

    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Self {
            join_ref: None,
            msg_ref: Some(msg_ref.into()),
            topic: HEARTBEAT_TOPIC.into(),
            event: HEARTBEAT.into(),
            payload: serde_json::json!({}),
        }
    }

    /// Wrap a player action for `topic`, its event name prefixed with
    /// `action_prefix`.
    pub fn push(
        topic: impl Into<String>,
        join_ref: impl Into<String>,
        msg_ref: impl Into<String>,
        action_prefix: &str,
        action: &ClientAction,
    ) -> Self {
        Self {
            join_ref: Some(join_ref.into()),
            msg_ref: Some(msg_ref.into()),
            topic: topic.into(),
            event: action.wire_event(action_prefix),
            payload: action.payload(),
        }
    }

    /// Decode the payload of a `phx_reply`.
    pub fn reply(&self) -> Option<ReplyPayload> {
        if self.event != PHX_REPLY {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

// ── Replies ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: serde_json::Value,
}

/// Successful join. Carries nothing beyond the fact of success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAck;

// ── Presence payloads ───────────────────────────────────────────────

/// One connection's metadata as tracked by server presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    /// Identifies one connection; required so joins and leaves can be
    /// matched to it.
    pub phx_ref: String,
    #[serde(default)]
    pub is_owner: bool,
    /// Any other fields the server tracks.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PresenceMeta {
    pub fn new(phx_ref: impl Into<String>, is_owner: bool) -> Self {
        Self {
            phx_ref: phx_ref.into(),
            is_owner,
            extra: serde_json::Map::new(),
        }
    }
}

/// All connections of one presence key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceEntry {
    #[serde(default)]
    pub metas: Vec<PresenceMeta>,
}

/// Presence key → entry, as sent in `presence_state` and in diffs.
pub type PresenceMap = BTreeMap<String, PresenceEntry>;

/// Payload of `presence_diff`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceMap,
    #[serde(default)]
    pub leaves: PresenceMap,
}

// ── Server events ───────────────────────────────────────────────────

/// Room events pushed by the server.
///
/// The `rps_`-prefixed names used by older servers are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(alias = "rps_room_closed")]
    RoomClosed {
        #[serde(default)]
        room_id: String,
    },
    #[serde(alias = "rps_game_started")]
    GameStarted {
        #[serde(default)]
        room_id: String,
    },
    #[serde(alias = "rps_game_finished")]
    GameFinished {
        winners: Vec<String>,
        plays: BTreeMap<String, String>,
        #[serde(default)]
        room_id: String,
    },
    #[serde(alias = "rps_play")]
    PlayerPlayed {
        by: String,
        #[serde(default)]
        room_id: String,
    },
    PresenceState(PresenceMap),
    PresenceDiff(PresenceDiff),
    /// Synthesized by the channel when the topic or transport goes away.
    /// Never appears on the wire.
    #[serde(skip)]
    Disconnected { reason: Option<String> },
}

impl ServerEvent {
    /// Decode a room event from a frame's `event` and `payload`.
    ///
    /// # Errors
    ///
    /// Fails for unknown event names and malformed payloads.
    pub fn from_frame(frame: &Frame) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "event": frame.event,
            "payload": frame.payload,
        }))
    }

    pub fn name(&self) -> EventName {
        match self {
            Self::RoomClosed { .. } => EventName::RoomClosed,
            Self::GameStarted { .. } => EventName::GameStarted,
            Self::GameFinished { .. } => EventName::GameFinished,
            Self::PlayerPlayed { .. } => EventName::PlayerPlayed,
            Self::PresenceState(_) => EventName::PresenceState,
            Self::PresenceDiff(_) => EventName::PresenceDiff,
            Self::Disconnected { .. } => EventName::Disconnected,
        }
    }
}

/// Key for registering a handler with [`SessionChannel::on`](crate::SessionChannel::on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventName {
    RoomClosed,
    GameStarted,
    GameFinished,
    PlayerPlayed,
    PresenceState,
    PresenceDiff,
    Disconnected,
}

impl EventName {
    pub const ALL: [EventName; 7] = [
        EventName::RoomClosed,
        EventName::GameStarted,
        EventName::GameFinished,
        EventName::PlayerPlayed,
        EventName::PresenceState,
        EventName::PresenceDiff,
        EventName::Disconnected,
    ];
}

// ── Client actions ──────────────────────────────────────────────────

/// The two actions a player can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Ask the server to begin a round. Only meaningful from the owner.
    StartGame,
    Play { mv: String },
}

impl ClientAction {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StartGame => "start_game",
            Self::Play { .. } => "play",
        }
    }

    /// Event name on the wire. Servers speaking the older dialect expect
    /// [`LEGACY_ACTION_PREFIX`].
    ///
    /// ```
    /// use rps_room_client::protocol::{ClientAction, LEGACY_ACTION_PREFIX};
    ///
    /// assert_eq!(ClientAction::StartGame.wire_event(""), "start_game");
    /// assert_eq!(ClientAction::StartGame.wire_event(LEGACY_ACTION_PREFIX), "rps_start_game");
    /// ```
    pub fn wire_event(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.event_name())
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::StartGame => serde_json::json!({}),
            Self::Play { mv } => serde_json::json!({ "move": mv }),
        }
    }
}

// ── Room info ───────────────────────────────────────────────────────

/// Result of creating or joining a room over HTTP; everything needed to open
/// a room session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub player_name: String,
    #[serde(default)]
    pub is_owner: bool,
}

impl RoomInfo {
    pub fn new(room_id: impl Into<String>, player_name: impl Into<String>, is_owner: bool) -> Self {
        Self {
            room_id: room_id.into(),
            player_name: player_name.into(),
            is_owner,
        }
    }

    /// Channel topic for this room, e.g. `rps_room:R1`.
    pub fn topic(&self, prefix: &str) -> String {
        format!("{prefix}:{}", self.room_id)
    }

    /// Socket URL carrying the room info as connect parameters.
    ///
    /// ```
    /// use rps_room_client::protocol::RoomInfo;
    ///
    /// let info = RoomInfo::new("R1", "Ann Lee", true);
    /// assert_eq!(
    ///     info.socket_url("ws://localhost:4000/socket/websocket"),
    ///     "ws://localhost:4000/socket/websocket?room_id=R1&player_name=Ann%20Lee&is_owner=true&vsn=2.0.0"
    /// );
    /// ```
    pub fn socket_url(&self, endpoint: &str) -> String {
        let sep = if endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{endpoint}{sep}room_id={}&player_name={}&is_owner={}&vsn={SERIALIZER_VSN}",
            urlencoding::encode(&self.room_id),
            urlencoding::encode(&self.player_name),
            self.is_owner,
        )
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &str, payload: serde_json::Value) -> Frame {
        Frame {
            join_ref: None,
            msg_ref: None,
            topic: "rps_room:R1".into(),
            event: event.into(),
            payload,
        }
    }

    #[test]
    fn frame_serializes_as_five_element_array() {
        let json = serde_json::to_value(Frame::join("rps_room:R1", "3")).unwrap();
        assert_eq!(json, json!(["3", "3", "rps_room:R1", "phx_join", {}]));
    }

    #[test]
    fn heartbeat_has_null_join_ref() {
        let json = serde_json::to_string(&Frame::heartbeat("9")).unwrap();
        assert_eq!(json, r#"[null,"9","phoenix","heartbeat",{}]"#);
    }

    #[test]
    fn frame_with_wrong_arity_is_rejected() {
        let result = serde_json::from_str::<Frame>(r#"["1","1","t","e"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn play_push_carries_move() {
        let action = ClientAction::Play { mv: "rock".into() };
        let f = Frame::push("rps_room:R1", "1", "4", "", &action);
        assert_eq!(f.event, "play");
        assert_eq!(f.payload, json!({"move": "rock"}));
        assert_eq!(f.join_ref.as_deref(), Some("1"));
    }

    #[test]
    fn start_game_push_has_empty_payload() {
        let f = Frame::push("rps_room:R1", "1", "2", "", &ClientAction::StartGame);
        assert_eq!(f.event, "start_game");
        assert_eq!(f.payload, json!({}));
    }

    #[test]
    fn legacy_prefix_renames_actions_only() {
        let play = ClientAction::Play { mv: "paper".into() };
        let f = Frame::push("rps_room:R1", "1", "3", LEGACY_ACTION_PREFIX, &play);
        assert_eq!(f.event, "rps_play");
        assert_eq!(f.payload, json!({"move": "paper"}));

        let f = Frame::push(
            "rps_room:R1",
            "1",
            "4",
            LEGACY_ACTION_PREFIX,
            &ClientAction::StartGame,
        );
        assert_eq!(f.event, "rps_start_game");
    }

    #[test]
    fn reply_decodes_ok_and_error() {
        let ok = frame(PHX_REPLY, json!({"status": "ok", "response": {}}));
        assert_eq!(ok.reply().unwrap().status, ReplyStatus::Ok);

        let err = frame(
            PHX_REPLY,
            json!({"status": "error", "response": {"reason": "room not found"}}),
        );
        let reply = err.reply().unwrap();
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.response["reason"], "room not found");

        assert!(frame("game_started", json!({})).reply().is_none());
    }

    #[test]
    fn decodes_game_finished() {
        let f = frame(
            "game_finished",
            json!({"winners": ["alice"], "plays": {"alice": "rock", "bob": "scissors"}, "room_id": "R1"}),
        );
        match ServerEvent::from_frame(&f).unwrap() {
            ServerEvent::GameFinished {
                winners,
                plays,
                room_id,
            } => {
                assert_eq!(winners, vec!["alice".to_string()]);
                assert_eq!(plays["bob"], "scissors");
                assert_eq!(room_id, "R1");
            }
            other => panic!("expected GameFinished, got {other:?}"),
        }
    }

    #[test]
    fn accepts_prefixed_event_names() {
        let f = frame("rps_play", json!({"by": "bob", "room_id": "R1"}));
        assert_eq!(
            ServerEvent::from_frame(&f).unwrap(),
            ServerEvent::PlayerPlayed {
                by: "bob".into(),
                room_id: "R1".into()
            }
        );
        let f = frame("rps_game_started", json!({"room_id": "R1"}));
        assert_eq!(
            ServerEvent::from_frame(&f).unwrap().name(),
            EventName::GameStarted
        );
    }

    #[test]
    fn decodes_presence_state_with_extra_meta_fields() {
        let f = frame(
            "presence_state",
            json!({"alice": {"metas": [{"phx_ref": "a1", "is_owner": true, "online_at": 17}]}}),
        );
        let ServerEvent::PresenceState(map) = ServerEvent::from_frame(&f).unwrap() else {
            panic!("expected PresenceState");
        };
        let meta = &map["alice"].metas[0];
        assert!(meta.is_owner);
        assert_eq!(meta.phx_ref, "a1");
        assert_eq!(meta.extra["online_at"], 17);
    }

    #[test]
    fn decodes_presence_diff_with_missing_sides() {
        let f = frame(
            "presence_diff",
            json!({"joins": {"bob": {"metas": [{"phx_ref": "b1"}]}}}),
        );
        let ServerEvent::PresenceDiff(diff) = ServerEvent::from_frame(&f).unwrap() else {
            panic!("expected PresenceDiff");
        };
        assert!(diff.joins.contains_key("bob"));
        assert!(diff.leaves.is_empty());
    }

    #[test]
    fn presence_meta_without_ref_is_rejected() {
        let f = frame(
            "presence_state",
            json!({"bob": {"metas": [{"is_owner": false}, {"is_owner": false}]}}),
        );
        assert!(ServerEvent::from_frame(&f).is_err());
    }

    #[test]
    fn unknown_event_is_an_error() {
        let f = frame("chat_message", json!({"text": "hi"}));
        assert!(ServerEvent::from_frame(&f).is_err());
    }

    #[test]
    fn disconnected_never_decodes_from_wire() {
        let f = frame("disconnected", json!({"reason": null}));
        assert!(ServerEvent::from_frame(&f).is_err());
    }

    #[test]
    fn room_info_from_http_response() {
        let info: RoomInfo =
            serde_json::from_str(r#"{"room_id":"R1","player_name":"alice","is_owner":true}"#)
                .unwrap();
        assert_eq!(info, RoomInfo::new("R1", "alice", true));
        assert_eq!(info.topic("rps_room"), "rps_room:R1");
    }

    #[test]
    fn socket_url_appends_to_existing_query() {
        let info = RoomInfo::new("R 2", "bob", false);
        assert_eq!(
            info.socket_url("wss://h/socket/websocket?token=x"),
            "wss://h/socket/websocket?token=x&room_id=R%202&player_name=bob&is_owner=false&vsn=2.0.0"
        );
    }
}
