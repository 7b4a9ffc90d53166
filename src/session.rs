//! Room session: the reconciled room model plus the player's actions.
//!
//! [`RoomSession`] registers a handler for every room event on its
//! [`SessionChannel`], feeds presence payloads through a
//! [`PresenceReconciler`], applies each resulting [`RoomInput`] with
//! [`RoomModel::transition`], and notifies subscribed listeners with a
//! [`RoomUpdate`]. Transitions only happen on the channel's dispatch task;
//! the model sits behind a single mutex that is released before listeners
//! run, so listeners may call back into the session (including
//! [`leave`](RoomSession::leave)).
//!
//! # Example
//!
//! ```rust,ignore
//! let info = RoomInfo::new("R1", "alice", true);
//! let transport = WebSocketTransport::connect(&info.socket_url(ENDPOINT)).await?;
//! let session = RoomSession::join(transport, info, SessionConfig::default()).await?;
//!
//! session.subscribe(|update| match update {
//!     RoomUpdate::Changed(model) => render(model),
//!     RoomUpdate::Closed { .. } => show_closed_banner(),
//! });
//!
//! session.request_start()?;
//! session.commit_move("rock")?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, info};

use crate::channel::{lock, ChannelConfig, SessionChannel};
use crate::error::{JoinError, Result, RoomError};
use crate::event::RoomUpdate;
use crate::presence::{PhoenixPresence, PresenceReconciler};
use crate::protocol::{ClientAction, EventName, RoomInfo, ServerEvent};
use crate::room::{MoveSet, RoomInput, RoomModel, RoundState, Transition};
use crate::transport::Transport;

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`RoomSession`].
///
/// ```
/// use rps_room_client::room::MoveSet;
/// use rps_room_client::session::SessionConfig;
///
/// let config = SessionConfig::default()
///     .with_moves(MoveSet::new(["rock", "paper", "scissors", "lizard", "spock"]));
/// assert!(config.moves.contains("lizard"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub channel: ChannelConfig,
    /// Allowed moves. Defaults to rock, paper, scissors.
    pub moves: MoveSet,
}

impl SessionConfig {
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    #[must_use]
    pub fn with_moves(mut self, moves: MoveSet) -> Self {
        self.moves = moves;
        self
    }
}

// ── Shared state ────────────────────────────────────────────────────

type Listener = Arc<dyn Fn(&RoomUpdate) + Send + Sync>;

/// Handle returned by [`RoomSession::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct SessionInner {
    info: RoomInfo,
    moves: MoveSet,
    channel: SessionChannel,
    model: StdMutex<RoomModel>,
    presence: StdMutex<Box<dyn PresenceReconciler>>,
    listeners: StdMutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    left: AtomicBool,
    terminated: AtomicBool,
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.left.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire)
    }

    fn handle(&self, event: ServerEvent) {
        if self.is_closed() {
            debug!(name = ?event.name(), "session closed, dropping event");
            return;
        }
        let input = match event {
            ServerEvent::PresenceState(snapshot) => {
                RoomInput::Presence(lock(&self.presence).reconcile_snapshot(snapshot))
            }
            ServerEvent::PresenceDiff(diff) => {
                RoomInput::Presence(lock(&self.presence).reconcile_diff(diff))
            }
            ServerEvent::GameStarted { .. } => RoomInput::GameStarted,
            ServerEvent::PlayerPlayed { by, .. } => RoomInput::PlayerPlayed { by },
            ServerEvent::GameFinished { winners, plays, .. } => RoomInput::GameFinished {
                winners: winners.into_iter().collect(),
                plays,
            },
            ServerEvent::RoomClosed { .. } => RoomInput::RoomClosed,
            ServerEvent::Disconnected { reason } => RoomInput::Disconnected { reason },
        };
        self.apply(input);
    }

    fn apply(&self, input: RoomInput) {
        let update = {
            let mut model = lock(&self.model);
            match model.transition(&input) {
                Transition::Changed(next) => {
                    debug!(round = ?next.round, members = next.membership.len(), "room updated");
                    *model = next.clone();
                    RoomUpdate::Changed(next)
                }
                Transition::Ignored(why) => {
                    debug!(?input, why, "input ignored");
                    return;
                }
                Transition::Terminal(reason) => {
                    info!(room_id = %model.room_id, ?reason, "room closed");
                    self.terminated.store(true, Ordering::Release);
                    RoomUpdate::Closed {
                        room_id: model.room_id.clone(),
                        reason,
                        last: model.clone(),
                    }
                }
            }
        };
        self.notify(&update);
    }

    fn notify(&self, update: &RoomUpdate) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(update);
        }
    }
}

// ── Session handle ──────────────────────────────────────────────────

/// A joined room.
///
/// Cheap to clone; all clones share the same model and channel.
#[derive(Clone)]
pub struct RoomSession {
    inner: Arc<SessionInner>,
}

impl RoomSession {
    /// Join the room described by `info` over `transport`, reconciling
    /// presence with [`PhoenixPresence`].
    ///
    /// # Errors
    ///
    /// Returns the channel's [`JoinError`]; no session exists in that case.
    pub async fn join(
        transport: impl Transport,
        info: RoomInfo,
        config: SessionConfig,
    ) -> std::result::Result<Self, JoinError> {
        Self::join_with_presence(transport, info, config, PhoenixPresence::new()).await
    }

    /// Like [`join`](Self::join) with a caller-supplied presence reconciler.
    ///
    /// # Errors
    ///
    /// Returns the channel's [`JoinError`]; no session exists in that case.
    pub async fn join_with_presence(
        transport: impl Transport,
        info: RoomInfo,
        config: SessionConfig,
        presence: impl PresenceReconciler,
    ) -> std::result::Result<Self, JoinError> {
        let topic = info.topic(&config.channel.topic_prefix);
        let model = RoomModel::new(
            info.room_id.as_str(),
            info.player_name.as_str(),
            info.is_owner,
        );
        let inner = Arc::new(SessionInner {
            channel: SessionChannel::new(transport, topic, config.channel),
            info,
            moves: config.moves,
            model: StdMutex::new(model),
            presence: StdMutex::new(Box::new(presence)),
            listeners: StdMutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            left: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });

        for name in EventName::ALL {
            let weak = Arc::downgrade(&inner);
            inner.channel.on(name, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle(event);
                }
            });
        }

        inner.channel.join().await?;
        info!(
            room_id = %inner.info.room_id,
            player = %inner.info.player_name,
            owner = inner.info.is_owner,
            "joined room"
        );
        Ok(Self { inner })
    }

    // ── Actions ─────────────────────────────────────────────────────

    /// Ask the server to begin a round.
    ///
    /// Only checks ownership locally; whether the round actually starts is
    /// up to the server and shows up later as a `game_started` update.
    ///
    /// # Errors
    ///
    /// - [`RoomError::ChannelClosed`] after [`leave`](Self::leave) or once
    ///   the room has closed
    /// - [`RoomError::NotOwner`] if the local player does not own the room
    pub fn request_start(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(RoomError::ChannelClosed);
        }
        if !self.inner.info.is_owner {
            return Err(RoomError::NotOwner);
        }
        debug!(room_id = %self.inner.info.room_id, "requesting round start");
        self.inner.channel.send(ClientAction::StartGame)
    }

    /// Commit a move for the current round.
    ///
    /// The local status is not touched; the server's `player_played` echo
    /// marks the player as decided.
    ///
    /// # Errors
    ///
    /// - [`RoomError::ChannelClosed`] after [`leave`](Self::leave) or once
    ///   the room has closed
    /// - [`RoomError::InvalidMove`] if `mv` is not in the configured move set
    /// - [`RoomError::RoundNotActive`] if no round is in progress
    pub fn commit_move(&self, mv: &str) -> Result<()> {
        if self.inner.is_closed() {
            return Err(RoomError::ChannelClosed);
        }
        if !self.inner.moves.contains(mv) {
            return Err(RoomError::InvalidMove { mv: mv.to_string() });
        }
        let round = lock(&self.inner.model).round;
        if round != RoundState::InProgress {
            return Err(RoomError::RoundNotActive { round });
        }
        debug!(mv, "committing move");
        self.inner
            .channel
            .send(ClientAction::Play { mv: mv.to_string() })
    }

    /// Leave the room: close the channel, drop all listeners, and stop
    /// applying events. Idempotent, and safe to call from a listener.
    pub fn leave(&self) {
        if self.inner.left.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(room_id = %self.inner.info.room_id, "leaving room");
        self.inner.channel.close();
        lock(&self.inner.listeners).clear();
    }

    /// [`leave`](Self::leave), then wait for the channel loop to finish.
    pub async fn shutdown(&self) {
        self.leave();
        self.inner.channel.shutdown().await;
    }

    // ── Observation ─────────────────────────────────────────────────

    /// Register a listener called once per transition with the new state.
    ///
    /// Past transitions are not replayed; read [`snapshot`](Self::snapshot)
    /// for the current state. Ignored after [`leave`](Self::leave).
    ///
    /// A listener holding a clone of this session keeps it alive until
    /// [`leave`](Self::leave) drops the listener list.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RoomUpdate) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        if !self.inner.left.load(Ordering::Acquire) {
            lock(&self.inner.listeners).push((id, Arc::new(listener)));
        }
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        lock(&self.inner.listeners).retain(|(existing, _)| *existing != id);
    }

    /// Current state of the room.
    pub fn snapshot(&self) -> RoomModel {
        lock(&self.inner.model).clone()
    }

    /// `true` once the player left or the room ended.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn room_id(&self) -> &str {
        &self.inner.info.room_id
    }

    pub fn identity(&self) -> &str {
        &self.inner.info.player_name
    }

    pub fn is_owner(&self) -> bool {
        self.inner.info.is_owner
    }

    pub fn moves(&self) -> &MoveSet {
        &self.inner.moves
    }

    pub fn topic(&self) -> &str {
        self.inner.channel.topic()
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.inner.info.room_id)
            .field("identity", &self.inner.info.player_name)
            .field("is_owner", &self.inner.info.is_owner)
            .field("closed", &self.is_closed())
            .finish()
    }
}
