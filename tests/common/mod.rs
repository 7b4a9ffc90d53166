#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared helpers for the room client integration tests.
//!
//! [`mock`] returns a [`MockTransport`] to hand to the client and a
//! [`MockServer`] the test drives: it pushes frames at the client and
//! inspects what the client sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rps_room_client::protocol::{Frame, PHX_REPLY};
use rps_room_client::{ChannelConfig, RoomError, SessionConfig, Transport};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const ROOM: &str = "R1";
pub const TOPIC: &str = "rps_room:R1";

type Incoming = Option<Result<String, RoomError>>;

// ── MockTransport ───────────────────────────────────────────────────

/// Transport fed by a [`MockServer`]. `recv` pends once the server handle
/// is dropped so the channel loop stays alive until shutdown.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<(), RoomError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RoomError::TransportClosed);
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, RoomError>> {
        match self.incoming.recv().await {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), RoomError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Test-side end of a [`MockTransport`].
pub struct MockServer {
    tx: mpsc::UnboundedSender<Incoming>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl MockServer {
    pub fn push(&self, frame: Frame) {
        self.push_raw(Some(Ok(serde_json::to_string(&frame).unwrap())));
    }

    /// Deliver a raw item: text, a transport error, or `None` for a clean close.
    pub fn push_raw(&self, item: Incoming) {
        let _ = self.tx.send(item);
    }

    /// Every frame the client sent, decoded.
    pub fn sent(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    /// Sent frames with `event`, ignoring heartbeats and control frames.
    pub fn sent_events(&self, event: &str) -> Vec<Frame> {
        self.sent()
            .into_iter()
            .filter(|f| f.event == event)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub fn mock() -> (MockTransport, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(StdMutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));
    (
        MockTransport {
            incoming: rx,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        },
        MockServer { tx, sent, closed },
    )
}

/// Short timeouts and no heartbeats.
pub fn session_config() -> SessionConfig {
    SessionConfig::default().with_channel(
        ChannelConfig::default()
            .with_join_timeout(Duration::from_millis(300))
            .with_heartbeat_interval(None)
            .with_shutdown_timeout(Duration::from_millis(100)),
    )
}

// ── Frames ──────────────────────────────────────────────────────────

/// A server push on the room topic.
pub fn push_frame(event: &str, payload: Value) -> Frame {
    Frame {
        join_ref: Some("1".into()),
        msg_ref: None,
        topic: TOPIC.into(),
        event: event.into(),
        payload,
    }
}

/// Successful reply to the join, which always carries ref `"1"`.
pub fn join_ok() -> Frame {
    Frame {
        join_ref: Some("1".into()),
        msg_ref: Some("1".into()),
        topic: TOPIC.into(),
        event: PHX_REPLY.into(),
        payload: json!({"status": "ok", "response": {}}),
    }
}

pub fn join_error(reason: &str) -> Frame {
    Frame {
        payload: json!({"status": "error", "response": {"reason": reason}}),
        ..join_ok()
    }
}

fn metas(entries: &[(&str, bool)]) -> Value {
    let map: serde_json::Map<String, Value> = entries
        .iter()
        .map(|(name, is_owner)| {
            (
                (*name).to_string(),
                json!({"metas": [{"phx_ref": format!("{name}-ref"), "is_owner": is_owner}]}),
            )
        })
        .collect();
    Value::Object(map)
}

/// `presence_state` with one connection per name; `alice` owns the room.
pub fn presence_state(names: &[&str]) -> Frame {
    let entries: Vec<(&str, bool)> = names.iter().map(|n| (*n, *n == "alice")).collect();
    push_frame("presence_state", metas(&entries))
}

pub fn presence_diff(joins: &[&str], leaves: &[&str]) -> Frame {
    let joins: Vec<(&str, bool)> = joins.iter().map(|n| (*n, *n == "alice")).collect();
    let leaves: Vec<(&str, bool)> = leaves.iter().map(|n| (*n, *n == "alice")).collect();
    push_frame(
        "presence_diff",
        json!({"joins": metas(&joins), "leaves": metas(&leaves)}),
    )
}

pub fn game_started() -> Frame {
    push_frame("game_started", json!({"room_id": ROOM}))
}

pub fn player_played(by: &str) -> Frame {
    push_frame("player_played", json!({"by": by, "room_id": ROOM}))
}

pub fn game_finished(winners: &[&str], plays: &[(&str, &str)]) -> Frame {
    let plays: serde_json::Map<String, Value> = plays
        .iter()
        .map(|(id, mv)| ((*id).to_string(), json!(mv)))
        .collect();
    push_frame(
        "game_finished",
        json!({"winners": winners, "plays": plays, "room_id": ROOM}),
    )
}

pub fn room_closed() -> Frame {
    push_frame("room_closed", json!({"room_id": ROOM}))
}

// ── Waiting ─────────────────────────────────────────────────────────

/// Poll `cond` until it holds, panicking after one second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
}

/// Give the channel loop a moment to drain pending frames.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
