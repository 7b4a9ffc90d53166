#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! End-to-end tests for `RoomSession` over a mock transport.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use rps_room_client::presence::PresenceReconciler;
use rps_room_client::protocol::{PresenceDiff, PresenceMap, LEGACY_ACTION_PREFIX, PHX_LEAVE};
use rps_room_client::{
    CloseReason, JoinError, Membership, MoveSet, PhoenixPresence, PlayerRoundStatus, RoomError,
    RoomInfo, RoomModel, RoomSession, RoomUpdate, RoundState,
};
use tokio::sync::mpsc;

type Updates = mpsc::UnboundedReceiver<RoomUpdate>;

fn record(session: &RoomSession) -> Updates {
    let (tx, rx) = mpsc::unbounded_channel();
    session.subscribe(move |update| {
        let _ = tx.send(update.clone());
    });
    rx
}

async fn next_update(rx: &mut Updates) -> RoomUpdate {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for update")
        .expect("listener dropped")
}

async fn next_model(rx: &mut Updates) -> RoomModel {
    match next_update(rx).await {
        RoomUpdate::Changed(model) => model,
        other => panic!("expected Changed, got {other:?}"),
    }
}

async fn assert_quiet(rx: &mut Updates) {
    settle().await;
    assert!(rx.try_recv().is_err(), "unexpected update");
}

/// Join as `alice` and apply a presence snapshot of `members`.
async fn joined(is_owner: bool, members: &[&str]) -> (RoomSession, MockServer, Updates) {
    let (transport, server) = mock();
    server.push(join_ok());
    let info = RoomInfo::new(ROOM, "alice", is_owner);
    let session = RoomSession::join(transport, info, session_config())
        .await
        .unwrap();
    let mut rx = record(&session);
    server.push(presence_state(members));
    next_model(&mut rx).await;
    (session, server, rx)
}

async fn in_round(members: &[&str]) -> (RoomSession, MockServer, Updates) {
    let (session, server, mut rx) = joined(true, members).await;
    server.push(game_started());
    next_model(&mut rx).await;
    (session, server, rx)
}

fn statuses(model: &RoomModel) -> Vec<(&str, &PlayerRoundStatus)> {
    model
        .statuses
        .iter()
        .map(|(id, status)| (id.as_str(), status))
        .collect()
}

// ── Join ────────────────────────────────────────────────────────────

#[tokio::test]
async fn join_subscribes_to_room_topic() {
    let (session, server, _rx) = joined(true, &["alice"]).await;

    let join = &server.sent()[0];
    assert_eq!(join.event, "phx_join");
    assert_eq!(join.topic, TOPIC);
    assert_eq!(session.topic(), TOPIC);
    assert_eq!(session.room_id(), ROOM);
    assert_eq!(session.identity(), "alice");
    assert!(session.is_owner());
    session.shutdown().await;
}

#[tokio::test]
async fn rejected_join_returns_join_error() {
    let (transport, server) = mock();
    server.push(join_error("room not found"));

    let result =
        RoomSession::join(transport, RoomInfo::new(ROOM, "bob", false), session_config()).await;
    match result {
        Err(JoinError::Rejected { response }) => assert_eq!(response["reason"], "room not found"),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert!(server.is_closed());
}

#[tokio::test]
async fn join_without_reply_times_out() {
    let (transport, _server) = mock();
    let result =
        RoomSession::join(transport, RoomInfo::new(ROOM, "bob", false), session_config()).await;
    assert!(matches!(result, Err(JoinError::Timeout)));
}

#[tokio::test]
async fn initial_snapshot_is_idle_and_empty() {
    let (transport, server) = mock();
    server.push(join_ok());
    let session = RoomSession::join(transport, RoomInfo::new(ROOM, "alice", true), session_config())
        .await
        .unwrap();

    let model = session.snapshot();
    assert_eq!(model.round, RoundState::Idle);
    assert!(model.membership.is_empty());
    assert!(model.statuses.is_empty());
    session.shutdown().await;
}

#[tokio::test]
async fn presence_before_join_reply_is_applied() {
    let (transport, server) = mock();
    server.push(presence_state(&["alice", "bob"]));
    server.push(join_ok());
    let session = RoomSession::join(transport, RoomInfo::new(ROOM, "alice", true), session_config())
        .await
        .unwrap();

    wait_until(|| session.snapshot().membership.len() == 2).await;
    session.shutdown().await;
}

// ── Presence ────────────────────────────────────────────────────────

#[tokio::test]
async fn presence_snapshot_and_diff_update_membership() {
    let (session, server, mut rx) = joined(true, &["alice", "bob"]).await;
    let model = session.snapshot();
    assert!(model.membership["alice"].is_owner);
    assert!(!model.membership["bob"].is_owner);

    server.push(presence_diff(&["carol"], &["bob"]));
    let model = next_model(&mut rx).await;
    let names: Vec<&str> = model.membership.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["alice", "carol"]);
    session.shutdown().await;
}

#[tokio::test]
async fn late_joiner_is_undecided_and_leaver_loses_status() {
    let (session, server, mut rx) = in_round(&["alice", "bob"]).await;

    server.push(presence_diff(&["carol"], &["bob"]));
    let model = next_model(&mut rx).await;
    assert_eq!(
        statuses(&model),
        vec![
            ("alice", &PlayerRoundStatus::Undecided),
            ("carol", &PlayerRoundStatus::Undecided),
        ]
    );
    session.shutdown().await;
}

/// Delegates to the default reconciler and counts calls.
struct CountingPresence {
    inner: PhoenixPresence,
    calls: Arc<AtomicUsize>,
}

impl PresenceReconciler for CountingPresence {
    fn reconcile_snapshot(&mut self, snapshot: PresenceMap) -> Membership {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.reconcile_snapshot(snapshot)
    }

    fn reconcile_diff(&mut self, diff: PresenceDiff) -> Membership {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.reconcile_diff(diff)
    }
}

#[tokio::test]
async fn custom_presence_reconciler_is_used() {
    let (transport, server) = mock();
    server.push(join_ok());
    let calls = Arc::new(AtomicUsize::new(0));
    let presence = CountingPresence {
        inner: PhoenixPresence::new(),
        calls: Arc::clone(&calls),
    };
    let session = RoomSession::join_with_presence(
        transport,
        RoomInfo::new(ROOM, "alice", true),
        session_config(),
        presence,
    )
    .await
    .unwrap();
    let mut rx = record(&session);

    server.push(presence_state(&["alice"]));
    server.push(presence_diff(&["bob"], &[]));
    next_model(&mut rx).await;
    let model = next_model(&mut rx).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(model.membership.len(), 2);
    session.shutdown().await;
}

// ── Round lifecycle ─────────────────────────────────────────────────

#[tokio::test]
async fn owner_starts_round() {
    let (session, server, mut rx) = joined(true, &["alice", "bob"]).await;

    session.request_start().unwrap();
    wait_until(|| server.sent_events("start_game").len() == 1).await;
    let push = &server.sent_events("start_game")[0];
    assert_eq!(push.topic, TOPIC);
    assert_eq!(push.payload, serde_json::json!({}));

    // Nothing changes locally until the server confirms.
    assert_eq!(session.snapshot().round, RoundState::Idle);

    server.push(game_started());
    let model = next_model(&mut rx).await;
    assert_eq!(model.round, RoundState::InProgress);
    assert_eq!(
        statuses(&model),
        vec![
            ("alice", &PlayerRoundStatus::Undecided),
            ("bob", &PlayerRoundStatus::Undecided),
        ]
    );
    session.shutdown().await;
}

#[tokio::test]
async fn player_played_marks_member_decided() {
    let (session, server, mut rx) = in_round(&["alice", "bob"]).await;

    server.push(player_played("alice"));
    let model = next_model(&mut rx).await;
    assert_eq!(
        statuses(&model),
        vec![
            ("alice", &PlayerRoundStatus::Decided),
            ("bob", &PlayerRoundStatus::Undecided),
        ]
    );
    session.shutdown().await;
}

#[tokio::test]
async fn game_finished_reveals_moves_and_winners() {
    let (session, server, mut rx) = in_round(&["alice", "bob"]).await;

    server.push(game_finished(&["alice"], &[("alice", "rock"), ("bob", "scissors")]));
    let model = next_model(&mut rx).await;
    assert_eq!(model.round, RoundState::Finished);
    assert_eq!(
        statuses(&model),
        vec![
            ("alice", &PlayerRoundStatus::Revealed("rock".into())),
            ("bob", &PlayerRoundStatus::Revealed("scissors".into())),
        ]
    );
    assert_eq!(
        model.last_winners.iter().map(String::as_str).collect::<Vec<_>>(),
        vec!["alice"]
    );
    session.shutdown().await;
}

#[tokio::test]
async fn next_round_resets_statuses_and_winners() {
    let (session, server, mut rx) = in_round(&["alice", "bob"]).await;
    server.push(game_finished(&["bob"], &[("alice", "rock"), ("bob", "paper")]));
    next_model(&mut rx).await;

    server.push(game_started());
    let model = next_model(&mut rx).await;
    assert_eq!(model.round, RoundState::InProgress);
    assert!(model.last_winners.is_empty());
    assert!(model
        .statuses
        .values()
        .all(|s| *s == PlayerRoundStatus::Undecided));
    session.shutdown().await;
}

#[tokio::test]
async fn events_are_applied_in_arrival_order() {
    let (session, server, mut rx) = in_round(&["alice", "bob"]).await;

    server.push(player_played("bob"));
    server.push(player_played("alice"));
    server.push(game_finished(&["alice"], &[("alice", "paper"), ("bob", "rock")]));

    let first = next_model(&mut rx).await;
    assert_eq!(first.status_of("bob"), Some(&PlayerRoundStatus::Decided));
    assert_eq!(first.status_of("alice"), Some(&PlayerRoundStatus::Undecided));
    let second = next_model(&mut rx).await;
    assert_eq!(second.status_of("alice"), Some(&PlayerRoundStatus::Decided));
    let third = next_model(&mut rx).await;
    assert_eq!(third.round, RoundState::Finished);
    session.shutdown().await;
}

#[tokio::test]
async fn out_of_round_events_are_ignored_without_notification() {
    let (session, server, mut rx) = joined(true, &["alice", "bob"]).await;

    server.push(player_played("bob"));
    server.push(game_finished(&["bob"], &[("bob", "rock")]));
    assert_quiet(&mut rx).await;
    assert_eq!(session.snapshot().round, RoundState::Idle);
    assert!(session.snapshot().statuses.is_empty());
    session.shutdown().await;
}

#[tokio::test]
async fn duplicate_and_unknown_player_played_are_ignored() {
    let (session, server, mut rx) = in_round(&["alice", "bob"]).await;
    server.push(player_played("bob"));
    next_model(&mut rx).await;

    server.push(player_played("bob"));
    server.push(player_played("mallory"));
    assert_quiet(&mut rx).await;
    assert!(!session.snapshot().statuses.contains_key("mallory"));
    session.shutdown().await;
}

// ── Actions ─────────────────────────────────────────────────────────

#[tokio::test]
async fn non_owner_cannot_request_start_in_any_round_state() {
    let (session, server, mut rx) = joined(false, &["alice", "bob"]).await;
    assert!(matches!(session.request_start(), Err(RoomError::NotOwner)));

    server.push(game_started());
    assert_eq!(next_model(&mut rx).await.round, RoundState::InProgress);
    assert!(matches!(session.request_start(), Err(RoomError::NotOwner)));

    server.push(game_finished(&["bob"], &[("alice", "rock"), ("bob", "paper")]));
    assert_eq!(next_model(&mut rx).await.round, RoundState::Finished);
    assert!(matches!(session.request_start(), Err(RoomError::NotOwner)));

    settle().await;
    assert!(server.sent_events("start_game").is_empty());
    session.shutdown().await;
}

#[tokio::test]
async fn commit_move_sends_play_without_local_change() {
    let (session, server, mut rx) = in_round(&["alice", "bob"]).await;

    session.commit_move("rock").unwrap();
    wait_until(|| server.sent_events("play").len() == 1).await;
    assert_eq!(
        server.sent_events("play")[0].payload,
        serde_json::json!({"move": "rock"})
    );
    assert_eq!(
        session.snapshot().status_of("alice"),
        Some(&PlayerRoundStatus::Undecided)
    );
    assert_quiet(&mut rx).await;

    server.push(player_played("alice"));
    let model = next_model(&mut rx).await;
    assert_eq!(model.status_of("alice"), Some(&PlayerRoundStatus::Decided));
    session.shutdown().await;
}

#[tokio::test]
async fn invalid_move_is_rejected_in_every_round_state() {
    let (session, server, mut rx) = joined(true, &["alice", "bob"]).await;
    assert!(matches!(
        session.commit_move("lizard"),
        Err(RoomError::InvalidMove { mv }) if mv == "lizard"
    ));

    server.push(game_started());
    next_model(&mut rx).await;
    assert!(matches!(
        session.commit_move("lizard"),
        Err(RoomError::InvalidMove { .. })
    ));

    server.push(game_finished(&[], &[]));
    next_model(&mut rx).await;
    assert!(matches!(
        session.commit_move("lizard"),
        Err(RoomError::InvalidMove { .. })
    ));

    settle().await;
    assert!(server.sent_events("play").is_empty());
    session.shutdown().await;
}

#[tokio::test]
async fn custom_move_set_accepts_extra_moves() {
    let (transport, server) = mock();
    server.push(join_ok());
    let config = session_config().with_moves(MoveSet::new([
        "rock", "paper", "scissors", "lizard", "spock",
    ]));
    let session = RoomSession::join(transport, RoomInfo::new(ROOM, "alice", true), config)
        .await
        .unwrap();
    let mut rx = record(&session);
    server.push(presence_state(&["alice"]));
    server.push(game_started());
    next_model(&mut rx).await;
    next_model(&mut rx).await;

    session.commit_move("lizard").unwrap();
    assert!(session.moves().contains("spock"));
    session.shutdown().await;
}

#[tokio::test]
async fn legacy_action_prefix_reaches_the_wire() {
    let (transport, server) = mock();
    server.push(join_ok());
    let config = session_config();
    let config = config
        .clone()
        .with_channel(config.channel.with_action_prefix(LEGACY_ACTION_PREFIX));
    let session = RoomSession::join(transport, RoomInfo::new(ROOM, "alice", true), config)
        .await
        .unwrap();
    let mut rx = record(&session);
    server.push(presence_state(&["alice", "bob"]));
    next_model(&mut rx).await;

    session.request_start().unwrap();
    server.push(game_started());
    next_model(&mut rx).await;
    session.commit_move("scissors").unwrap();

    wait_until(|| server.sent_events("rps_play").len() == 1).await;
    assert_eq!(server.sent_events("rps_start_game").len(), 1);
    assert!(server.sent_events("play").is_empty());
    session.shutdown().await;
}

#[tokio::test]
async fn commit_move_outside_round_is_rejected() {
    let (session, server, mut rx) = joined(true, &["alice", "bob"]).await;
    assert!(matches!(
        session.commit_move("rock"),
        Err(RoomError::RoundNotActive {
            round: RoundState::Idle
        })
    ));

    server.push(game_started());
    next_model(&mut rx).await;
    server.push(game_finished(&["alice"], &[("alice", "rock")]));
    next_model(&mut rx).await;
    assert!(matches!(
        session.commit_move("rock"),
        Err(RoomError::RoundNotActive {
            round: RoundState::Finished
        })
    ));
    session.shutdown().await;
}

// ── Listeners ───────────────────────────────────────────────────────

#[tokio::test]
async fn every_listener_sees_each_transition_once() {
    let (session, server, mut first) = joined(true, &["alice", "bob"]).await;
    let mut second = record(&session);

    server.push(game_started());
    let a = next_model(&mut first).await;
    let b = next_model(&mut second).await;
    assert_eq!(a, b);
    assert_quiet(&mut first).await;
    assert_quiet(&mut second).await;
    session.shutdown().await;
}

#[tokio::test]
async fn new_listener_gets_no_replay() {
    let (session, server, _rx) = joined(true, &["alice", "bob"]).await;
    server.push(game_started());
    wait_until(|| session.snapshot().round == RoundState::InProgress).await;

    let mut late = record(&session);
    assert_quiet(&mut late).await;

    server.push(player_played("bob"));
    let model = next_model(&mut late).await;
    assert_eq!(model.status_of("bob"), Some(&PlayerRoundStatus::Decided));
    session.shutdown().await;
}

#[tokio::test]
async fn unsubscribed_listener_is_not_called() {
    let (session, server, mut kept) = joined(true, &["alice", "bob"]).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let id = session.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    session.unsubscribe(id);

    server.push(game_started());
    next_model(&mut kept).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    session.shutdown().await;
}

// ── Leaving and closing ─────────────────────────────────────────────

#[tokio::test]
async fn leave_stops_updates_and_closes_channel() {
    let (session, server, mut rx) = joined(true, &["alice", "bob"]).await;

    session.leave();
    assert!(session.is_closed());
    server.push(game_started());
    assert_quiet(&mut rx).await;

    wait_until(|| server.is_closed()).await;
    assert_eq!(server.sent_events(PHX_LEAVE).len(), 1);
    assert!(matches!(
        session.request_start(),
        Err(RoomError::ChannelClosed)
    ));

    session.leave();
    session.shutdown().await;
    assert_eq!(server.sent_events(PHX_LEAVE).len(), 1);
}

#[tokio::test]
async fn listener_can_leave_from_inside_a_notification() {
    let (session, server, mut rx) = joined(true, &["alice", "bob"]).await;
    let handle = session.clone();
    session.subscribe(move |update| {
        if update.model().round == RoundState::InProgress {
            handle.leave();
        }
    });

    server.push(game_started());
    next_model(&mut rx).await;
    wait_until(|| session.is_closed()).await;

    server.push(player_played("bob"));
    assert_quiet(&mut rx).await;
    session.shutdown().await;
}

#[tokio::test]
async fn room_closed_is_terminal() {
    let (session, server, mut rx) = in_round(&["alice", "bob"]).await;

    server.push(room_closed());
    match next_update(&mut rx).await {
        RoomUpdate::Closed {
            room_id,
            reason,
            last,
        } => {
            assert_eq!(room_id, ROOM);
            assert_eq!(reason, CloseReason::ServerClosed);
            assert_eq!(last.round, RoundState::InProgress);
        }
        other => panic!("expected Closed, got {other:?}"),
    }
    assert!(session.is_closed());

    server.push(player_played("bob"));
    server.push(game_started());
    assert_quiet(&mut rx).await;
    session.leave();
    session.shutdown().await;
}

#[tokio::test]
async fn actions_fail_once_the_room_is_closed() {
    let (session, server, mut rx) = in_round(&["alice", "bob"]).await;

    server.push(room_closed());
    assert!(next_update(&mut rx).await.is_terminal());

    assert!(matches!(
        session.request_start(),
        Err(RoomError::ChannelClosed)
    ));
    assert!(matches!(
        session.commit_move("rock"),
        Err(RoomError::ChannelClosed)
    ));
    settle().await;
    assert!(server.sent_events("start_game").is_empty());
    assert!(server.sent_events("play").is_empty());
    session.leave();
    session.shutdown().await;
}

#[tokio::test]
async fn lost_connection_closes_room() {
    let (session, server, mut rx) = joined(true, &["alice", "bob"]).await;

    server.push_raw(None);
    let update = next_update(&mut rx).await;
    assert!(update.is_terminal());
    assert!(matches!(
        update,
        RoomUpdate::Closed {
            reason: CloseReason::Disconnected(None),
            ..
        }
    ));
    assert!(session.is_closed());
    wait_until(|| matches!(session.request_start(), Err(RoomError::ChannelClosed))).await;
}

#[tokio::test]
async fn server_phx_close_closes_room() {
    let (session, server, mut rx) = joined(true, &["alice"]).await;

    server.push(push_frame("phx_close", serde_json::json!({})));
    match next_update(&mut rx).await {
        RoomUpdate::Closed {
            reason: CloseReason::Disconnected(Some(reason)),
            ..
        } => assert_eq!(reason, "phx_close"),
        other => panic!("expected Closed, got {other:?}"),
    }
    wait_until(|| server.is_closed()).await;
    session.shutdown().await;
}
