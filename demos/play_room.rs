//! # Play Room Demo
//!
//! Joins a rock-paper-scissors room and plays it from the terminal log:
//!
//! 1. Connect to the room socket via WebSocket
//! 2. Join the room's channel topic
//! 3. As owner, start a round once someone else is present
//! 4. Commit a move every round and log the results
//! 5. Leave on Ctrl+C or when the room closes
//!
//! ## Running
//!
//! ```sh
//! # Create a room over HTTP first, then:
//! RPS_ROOM=R1 RPS_PLAYER=alice RPS_OWNER=true cargo run --example play_room
//!
//! # Other knobs:
//! RPS_URL=ws://my-server:4000/socket/websocket RPS_MOVE=paper cargo run --example play_room
//!
//! # Servers that expect `rps_play` / `rps_start_game`:
//! RPS_LEGACY_ACTIONS=true cargo run --example play_room
//! ```

use rps_room_client::protocol::LEGACY_ACTION_PREFIX;
use rps_room_client::{
    ChannelConfig, CloseReason, PlayerRoundStatus, RoomInfo, RoomSession, RoomUpdate, RoundState,
    SessionConfig, WebSocketTransport,
};

const DEFAULT_URL: &str = "ws://localhost:4000/socket/websocket";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=rps_room_client=debug` for frame-level output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = env_or("RPS_URL", DEFAULT_URL);
    let info = RoomInfo::new(
        env_or("RPS_ROOM", "R1"),
        env_or("RPS_PLAYER", "rustacean"),
        env_or("RPS_OWNER", "false") == "true",
    );
    let my_move = env_or("RPS_MOVE", "rock");
    let mut channel = ChannelConfig::default();
    if env_or("RPS_LEGACY_ACTIONS", "false") == "true" {
        channel = channel.with_action_prefix(LEGACY_ACTION_PREFIX);
    }
    let config = SessionConfig::default().with_channel(channel);

    // ── Join ────────────────────────────────────────────────────────
    let transport = WebSocketTransport::connect(&url, &info).await?;
    let session = RoomSession::join(transport, info, config).await?;
    tracing::info!("Joined room {} as {}", session.room_id(), session.identity());

    // Listeners run on the channel task; forward updates to this one.
    let (tx, mut updates) = tokio::sync::mpsc::unbounded_channel();
    session.subscribe(move |update| {
        let _ = tx.send(update.clone());
    });

    // ── Event loop ──────────────────────────────────────────────────
    let mut start_requested = false;
    let mut committed = false;
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                match update {
                    RoomUpdate::Changed(model) => match model.round {
                        RoundState::Idle | RoundState::Finished => {
                            committed = false;
                            if model.round == RoundState::Finished {
                                tracing::info!("Round over, winners: {:?}", model.last_winners);
                                for (player, status) in &model.statuses {
                                    if let PlayerRoundStatus::Revealed(mv) = status {
                                        tracing::info!("  {player} played {mv}");
                                    }
                                }
                            }
                            if model.can_request_start() && model.membership.len() >= 2 && !start_requested {
                                session.request_start()?;
                                start_requested = true;
                                tracing::info!("Requested a new round");
                            }
                        }
                        RoundState::InProgress => {
                            start_requested = false;
                            let decided = model
                                .statuses
                                .values()
                                .filter(|s| **s == PlayerRoundStatus::Decided)
                                .count();
                            tracing::info!("Round in progress: {decided}/{} decided", model.statuses.len());
                            if !committed {
                                session.commit_move(&my_move)?;
                                committed = true;
                                tracing::info!("Committed {my_move}");
                            }
                        }
                    },
                    RoomUpdate::Closed { reason, .. } => {
                        match reason {
                            CloseReason::ServerClosed => tracing::info!("Room closed by the server"),
                            CloseReason::Disconnected(why) => {
                                tracing::warn!("Disconnected: {}", why.as_deref().unwrap_or("unknown"));
                            }
                        }
                        break;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, leaving room");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    session.shutdown().await;
    Ok(())
}
