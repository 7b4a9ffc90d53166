//! Room model and its transition function.
//!
//! [`RoomModel`] is the client's reconciled view of one room: who is present,
//! which round state the room is in, which players have committed a move, and
//! who won the last round. It only ever changes through
//! [`RoomModel::transition`], which is pure: given the current model and one
//! [`RoomInput`] it returns the next model (or says the input is ignored, or
//! that the room has ended). The server is authoritative; nothing here
//! predicts or resolves moves locally.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::event::CloseReason;

/// Display name that identifies a player within a room.
pub type Identity = String;

/// Reconciled membership, keyed by identity.
pub type Membership = BTreeMap<Identity, Member>;

/// A player currently present in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub identity: Identity,
    /// Set for the room creator. Fixed at creation, never transferred.
    pub is_owner: bool,
}

impl Member {
    pub fn new(identity: impl Into<Identity>, is_owner: bool) -> Self {
        Self {
            identity: identity.into(),
            is_owner,
        }
    }
}

/// Lifecycle of the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    /// No round has been played yet.
    #[default]
    Idle,
    /// The server started a round; moves may be committed.
    InProgress,
    /// The server revealed the last round's moves and winners.
    Finished,
}

/// Per-player progress within a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "move", rename_all = "snake_case")]
pub enum PlayerRoundStatus {
    Undecided,
    /// The server reported a committed move without revealing it.
    Decided,
    /// The move disclosed when the round finished.
    Revealed(String),
}

// ── Move set ────────────────────────────────────────────────────────

/// Moves accepted by [`commit_move`](crate::RoomSession::commit_move).
///
/// # Example
///
/// ```
/// use rps_room_client::room::MoveSet;
///
/// let moves = MoveSet::default();
/// assert!(moves.contains("rock"));
/// assert!(!moves.contains("lizard"));
///
/// let extended = MoveSet::new(["rock", "paper", "scissors", "lizard", "spock"]);
/// assert!(extended.contains("spock"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveSet(BTreeSet<String>);

impl MoveSet {
    pub fn new<I, S>(moves: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(moves.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, mv: &str) -> bool {
        self.0.contains(mv)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for MoveSet {
    fn default() -> Self {
        Self::new(["rock", "paper", "scissors"])
    }
}

// ── Inputs ──────────────────────────────────────────────────────────

/// One input to the transition function.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomInput {
    /// Output of the presence reconciler after a snapshot or diff.
    Presence(Membership),
    GameStarted,
    PlayerPlayed {
        by: Identity,
    },
    GameFinished {
        winners: BTreeSet<Identity>,
        plays: BTreeMap<Identity, String>,
    },
    RoomClosed,
    /// The channel went away without a `room_closed` event.
    Disconnected {
        reason: Option<String>,
    },
}

/// Result of applying one [`RoomInput`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The input was accepted; this is the new model.
    Changed(RoomModel),
    /// The input does not apply in the current state.
    Ignored(&'static str),
    /// The room is gone. No further inputs will be applied.
    Terminal(CloseReason),
}

// ── Model ───────────────────────────────────────────────────────────

/// Client-side reconciled state of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomModel {
    pub room_id: String,
    /// The local player.
    pub identity: Identity,
    /// Whether the local player owns the room.
    pub is_owner: bool,
    pub membership: Membership,
    pub round: RoundState,
    /// Only members with a round status have an entry; in `Idle` this is empty.
    pub statuses: BTreeMap<Identity, PlayerRoundStatus>,
    pub last_winners: BTreeSet<Identity>,
}

impl RoomModel {
    /// Fresh model for a just-joined room: nobody present yet, round idle.
    pub fn new(room_id: impl Into<String>, identity: impl Into<Identity>, is_owner: bool) -> Self {
        Self {
            room_id: room_id.into(),
            identity: identity.into(),
            is_owner,
            membership: Membership::new(),
            round: RoundState::Idle,
            statuses: BTreeMap::new(),
            last_winners: BTreeSet::new(),
        }
    }

    /// Whether move buttons should be enabled.
    pub fn can_commit_move(&self) -> bool {
        self.round == RoundState::InProgress
    }

    /// Whether the start control should be shown.
    pub fn can_request_start(&self) -> bool {
        self.is_owner
    }

    pub fn status_of(&self, identity: &str) -> Option<&PlayerRoundStatus> {
        self.statuses.get(identity)
    }

    /// Compute the model that follows `input`.
    pub fn transition(&self, input: &RoomInput) -> Transition {
        match input {
            RoomInput::Presence(membership) => {
                let mut next = self.clone();
                next.statuses.retain(|id, _| membership.contains_key(id));
                if self.round == RoundState::InProgress {
                    for id in membership.keys() {
                        next.statuses
                            .entry(id.clone())
                            .or_insert(PlayerRoundStatus::Undecided);
                    }
                }
                next.membership = membership.clone();
                Transition::Changed(next)
            }

            // Accepted from every state; a repeat while in progress is a reset.
            RoomInput::GameStarted => {
                let mut next = self.clone();
                next.round = RoundState::InProgress;
                next.statuses = self
                    .membership
                    .keys()
                    .map(|id| (id.clone(), PlayerRoundStatus::Undecided))
                    .collect();
                next.last_winners.clear();
                Transition::Changed(next)
            }

            RoomInput::PlayerPlayed { by } => {
                if self.round != RoundState::InProgress {
                    return Transition::Ignored("player_played outside of a round");
                }
                if !self.membership.contains_key(by) {
                    return Transition::Ignored("player_played for unknown member");
                }
                if self.statuses.get(by) == Some(&PlayerRoundStatus::Decided) {
                    return Transition::Ignored("player already decided");
                }
                let mut next = self.clone();
                next.statuses.insert(by.clone(), PlayerRoundStatus::Decided);
                Transition::Changed(next)
            }

            RoomInput::GameFinished { winners, plays } => {
                if self.round != RoundState::InProgress {
                    return Transition::Ignored("game_finished outside of a round");
                }
                let mut next = self.clone();
                next.round = RoundState::Finished;
                for (id, mv) in plays {
                    next.statuses
                        .insert(id.clone(), PlayerRoundStatus::Revealed(mv.clone()));
                }
                next.last_winners = winners.clone();
                Transition::Changed(next)
            }

            RoomInput::RoomClosed => Transition::Terminal(CloseReason::ServerClosed),

            RoomInput::Disconnected { reason } => {
                Transition::Terminal(CloseReason::Disconnected(reason.clone()))
            }
        }
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

    fn members(names: &[&str]) -> Membership {
        names
            .iter()
            .map(|n| ((*n).to_string(), Member::new(*n, *n == "alice")))
            .collect()
    }

    fn apply(model: &RoomModel, input: RoomInput) -> RoomModel {
        match model.transition(&input) {
            Transition::Changed(next) => next,
            other => panic!("expected Changed for {input:?}, got {other:?}"),
        }
    }

    fn in_round(names: &[&str]) -> RoomModel {
        let model = RoomModel::new("R1", "alice", true);
        let model = apply(&model, RoomInput::Presence(members(names)));
        apply(&model, RoomInput::GameStarted)
    }

    fn finished(winners: &[&str], plays: &[(&str, &str)]) -> RoomInput {
        RoomInput::GameFinished {
            winners: winners.iter().map(|w| (*w).to_string()).collect(),
            plays: plays
                .iter()
                .map(|(id, mv)| ((*id).to_string(), (*mv).to_string()))
                .collect(),
        }
    }

    #[test]
    fn new_model_is_idle_and_empty() {
        let model = RoomModel::new("R1", "alice", true);
        assert_eq!(model.round, RoundState::Idle);
        assert!(model.membership.is_empty());
        assert!(model.statuses.is_empty());
        assert!(!model.can_commit_move());
        assert!(model.can_request_start());
    }

    #[test]
    fn presence_in_idle_sets_membership_without_statuses() {
        let model = RoomModel::new("R1", "alice", true);
        let next = apply(&model, RoomInput::Presence(members(&["alice", "bob"])));
        assert_eq!(next.membership.len(), 2);
        assert!(next.membership["alice"].is_owner);
        assert!(next.statuses.is_empty());
    }

    #[test]
    fn presence_during_round_adds_late_joiner_as_undecided() {
        let model = in_round(&["alice", "bob"]);
        let model = apply(
            &model,
            RoomInput::PlayerPlayed {
                by: "alice".into(),
            },
        );
        let next = apply(
            &model,
            RoomInput::Presence(members(&["alice", "bob", "carol"])),
        );
        assert_eq!(next.status_of("alice"), Some(&PlayerRoundStatus::Decided));
        assert_eq!(next.status_of("carol"), Some(&PlayerRoundStatus::Undecided));
    }

    #[test]
    fn presence_removes_statuses_of_departed_members() {
        let model = in_round(&["alice", "bob"]);
        let next = apply(&model, RoomInput::Presence(members(&["alice"])));
        assert!(next.status_of("bob").is_none());
        assert!(!next.membership.contains_key("bob"));
    }

    #[test]
    fn presence_after_finish_does_not_add_statuses() {
        let model = in_round(&["alice", "bob"]);
        let model = apply(&model, finished(&["alice"], &[("alice", "rock"), ("bob", "scissors")]));
        let next = apply(
            &model,
            RoomInput::Presence(members(&["alice", "bob", "dave"])),
        );
        assert!(next.status_of("dave").is_none());
        assert_eq!(
            next.status_of("bob"),
            Some(&PlayerRoundStatus::Revealed("scissors".into()))
        );
    }

    #[test]
    fn game_started_resets_everyone_to_undecided() {
        let model = in_round(&["alice", "bob"]);
        assert_eq!(model.round, RoundState::InProgress);
        assert!(model.can_commit_move());
        assert!(model
            .statuses
            .values()
            .all(|s| *s == PlayerRoundStatus::Undecided));
    }

    #[test]
    fn game_started_after_finish_clears_reveals_and_winners() {
        let model = in_round(&["alice", "bob"]);
        let model = apply(&model, finished(&["alice"], &[("alice", "rock"), ("bob", "scissors")]));
        let next = apply(&model, RoomInput::GameStarted);
        assert_eq!(next.round, RoundState::InProgress);
        assert!(next.last_winners.is_empty());
        assert_eq!(next.status_of("alice"), Some(&PlayerRoundStatus::Undecided));
        assert_eq!(next.status_of("bob"), Some(&PlayerRoundStatus::Undecided));
    }

    #[test]
    fn repeated_game_started_is_an_idempotent_reset() {
        let model = in_round(&["alice", "bob"]);
        let decided = apply(
            &model,
            RoomInput::PlayerPlayed {
                by: "bob".into(),
            },
        );
        let again = apply(&decided, RoomInput::GameStarted);
        assert_eq!(again, model);
        assert_eq!(apply(&again, RoomInput::GameStarted), model);
    }

    #[test]
    fn player_played_marks_only_that_player() {
        let model = in_round(&["alice", "bob"]);
        let next = apply(
            &model,
            RoomInput::PlayerPlayed {
                by: "alice".into(),
            },
        );
        assert_eq!(next.status_of("alice"), Some(&PlayerRoundStatus::Decided));
        assert_eq!(next.status_of("bob"), Some(&PlayerRoundStatus::Undecided));
    }

    #[test]
    fn duplicate_player_played_is_ignored() {
        let model = in_round(&["alice", "bob"]);
        let input = RoomInput::PlayerPlayed {
            by: "alice".into(),
        };
        let next = apply(&model, input.clone());
        assert!(matches!(next.transition(&input), Transition::Ignored(_)));
        assert_eq!(next.status_of("alice"), Some(&PlayerRoundStatus::Decided));
    }

    #[test]
    fn player_played_for_non_member_is_ignored() {
        let model = in_round(&["alice", "bob"]);
        let result = model.transition(&RoomInput::PlayerPlayed { by: "mallory".into() });
        assert!(matches!(result, Transition::Ignored(_)));
    }

    #[test]
    fn player_played_outside_round_is_ignored() {
        let model = RoomModel::new("R1", "alice", true);
        let model = apply(&model, RoomInput::Presence(members(&["alice"])));
        let result = model.transition(&RoomInput::PlayerPlayed { by: "alice".into() });
        assert!(matches!(result, Transition::Ignored(_)));
    }

    #[test]
    fn game_finished_reveals_plays_and_sets_winners() {
        let model = in_round(&["alice", "bob"]);
        let next = apply(&model, finished(&["alice"], &[("alice", "rock"), ("bob", "scissors")]));
        assert_eq!(next.round, RoundState::Finished);
        assert!(!next.can_commit_move());
        assert_eq!(
            next.status_of("alice"),
            Some(&PlayerRoundStatus::Revealed("rock".into()))
        );
        assert_eq!(
            next.status_of("bob"),
            Some(&PlayerRoundStatus::Revealed("scissors".into()))
        );
        assert_eq!(next.last_winners, BTreeSet::from(["alice".to_string()]));
    }

    #[test]
    fn game_finished_keeps_status_of_players_missing_from_plays() {
        let model = in_round(&["alice", "bob", "carol"]);
        let model = apply(
            &model,
            RoomInput::PlayerPlayed {
                by: "carol".into(),
            },
        );
        let next = apply(&model, finished(&["alice"], &[("alice", "rock")]));
        assert_eq!(next.status_of("bob"), Some(&PlayerRoundStatus::Undecided));
        assert_eq!(next.status_of("carol"), Some(&PlayerRoundStatus::Decided));
    }

    #[test]
    fn game_finished_accepts_winner_absent_from_plays() {
        let model = in_round(&["alice", "bob"]);
        let next = apply(&model, finished(&["zed"], &[("alice", "rock")]));
        assert!(next.last_winners.contains("zed"));
    }

    #[test]
    fn game_finished_outside_round_is_ignored() {
        let idle = RoomModel::new("R1", "alice", true);
        let input = finished(&["alice"], &[("alice", "rock")]);
        assert!(matches!(idle.transition(&input), Transition::Ignored(_)));

        let done = apply(&in_round(&["alice"]), input.clone());
        assert!(matches!(done.transition(&input), Transition::Ignored(_)));
    }

    #[test]
    fn room_closed_is_terminal_from_every_state() {
        let idle = RoomModel::new("R1", "alice", true);
        let running = in_round(&["alice"]);
        let done = apply(&running, finished(&[], &[]));
        for model in [idle, running, done] {
            assert_eq!(
                model.transition(&RoomInput::RoomClosed),
                Transition::Terminal(CloseReason::ServerClosed)
            );
        }
    }

    #[test]
    fn disconnect_is_terminal_with_reason() {
        let model = RoomModel::new("R1", "bob", false);
        let result = model.transition(&RoomInput::Disconnected {
            reason: Some("gone".into()),
        });
        assert_eq!(
            result,
            Transition::Terminal(CloseReason::Disconnected(Some("gone".into())))
        );
    }

    #[test]
    fn default_move_set_is_rock_paper_scissors() {
        let moves = MoveSet::default();
        let all: Vec<&str> = moves.iter().collect();
        assert_eq!(all, vec!["paper", "rock", "scissors"]);
    }

    #[test]
    fn status_serializes_with_move() {
        let json = serde_json::to_value(PlayerRoundStatus::Revealed("rock".into())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "revealed", "move": "rock"}));
        let json = serde_json::to_value(PlayerRoundStatus::Decided).unwrap();
        assert_eq!(json, serde_json::json!({"status": "decided"}));
    }
}
