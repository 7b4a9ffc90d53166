//! Session channel: one subscription to a room's event topic.
//!
//! [`SessionChannel`] owns the transport. [`join`](SessionChannel::join)
//! performs the subscribe handshake and then spawns a background loop that
//! multiplexes outbound actions, heartbeats, and inbound frames with
//! `tokio::select!`. Inbound room events are dispatched to the handler
//! registered for their [`EventName`], one at a time, on that loop task.
//!
//! # Example
//!
//! ```rust,ignore
//! let channel = SessionChannel::new(transport, "rps_room:R1", ChannelConfig::default());
//! channel.on(EventName::GameStarted, |event| println!("{event:?}"));
//! channel.join().await?;
//! channel.send(ClientAction::StartGame)?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::error::{JoinError, Result, RoomError};
use crate::protocol::{
    ClientAction, EventName, Frame, JoinAck, ReplyStatus, ServerEvent, HEARTBEAT_TOPIC, PHX_CLOSE,
    PHX_ERROR, PHX_REPLY,
};
use crate::transport::Transport;

/// Default topic prefix; a room's topic is `"<prefix>:<room_id>"`.
pub const DEFAULT_TOPIC_PREFIX: &str = "rps_room";

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SessionChannel`].
///
/// # Example
///
/// ```
/// use rps_room_client::channel::ChannelConfig;
/// use std::time::Duration;
///
/// let config = ChannelConfig::default()
///     .with_join_timeout(Duration::from_secs(3))
///     .with_heartbeat_interval(None);
/// assert_eq!(config.topic_prefix, "rps_room");
/// assert!(config.heartbeat_interval.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Prefix of the room topic. Defaults to `"rps_room"`.
    pub topic_prefix: String,
    /// How long to wait for the join reply. Defaults to **10 seconds**.
    pub join_timeout: Duration,
    /// Prepended to outbound action names. Defaults to empty (`play`,
    /// `start_game`). Servers expecting `rps_play` and `rps_start_game` need
    /// [`LEGACY_ACTION_PREFIX`](crate::protocol::LEGACY_ACTION_PREFIX).
    pub action_prefix: String,
    /// Interval between socket heartbeats, or `None` to disable them.
    /// Defaults to **30 seconds**.
    pub heartbeat_interval: Option<Duration>,
    /// How long [`SessionChannel::shutdown`] waits for the loop to send
    /// `phx_leave` and close the transport before aborting it.
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            action_prefix: String::new(),
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_action_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.action_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Zero intervals are treated as disabled.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval.filter(|d| !d.is_zero());
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Shared state ────────────────────────────────────────────────────

type Handler = Box<dyn FnMut(ServerEvent) + Send>;

/// A registered handler, or the marker left while it is running.
enum Slot {
    Idle(Handler),
    Running,
}

type Handlers = Arc<StdMutex<HashMap<EventName, Slot>>>;

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ChannelState {
    joined: AtomicBool,
    closed: AtomicBool,
}

/// Everything the loop task takes ownership of once the join succeeds.
struct Pending {
    transport: Box<dyn Transport>,
    cmd_rx: mpsc::UnboundedReceiver<ClientAction>,
    shutdown_rx: oneshot::Receiver<()>,
}

/// Monotonic message refs, rendered as decimal strings.
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

// ── Channel handle ──────────────────────────────────────────────────

/// Handle to one room topic subscription.
///
/// All methods take `&self`; the handle can be shared behind an `Arc`.
pub struct SessionChannel {
    topic: String,
    config: ChannelConfig,
    handlers: Handlers,
    state: Arc<ChannelState>,
    pending: StdMutex<Option<Pending>>,
    cmd_tx: mpsc::UnboundedSender<ClientAction>,
    shutdown_tx: StdMutex<Option<oneshot::Sender<()>>>,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionChannel {
    /// Wrap a connected transport. Nothing is sent until [`join`](Self::join).
    pub fn new(transport: impl Transport, topic: impl Into<String>, config: ChannelConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Self {
            topic: topic.into(),
            config,
            handlers: Arc::new(StdMutex::new(HashMap::new())),
            state: Arc::new(ChannelState {
                joined: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            pending: StdMutex::new(Some(Pending {
                transport: Box::new(transport),
                cmd_rx,
                shutdown_rx,
            })),
            cmd_tx,
            shutdown_tx: StdMutex::new(Some(shutdown_tx)),
            task: StdMutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_joined(&self) -> bool {
        self.state.joined.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Register the handler for `name`, replacing any previous one.
    ///
    /// May be called before or after [`join`](Self::join). Events with no
    /// registered handler are dropped. Handlers run on the channel's loop
    /// task, never concurrently with each other.
    pub fn on<F>(&self, name: EventName, handler: F)
    where
        F: FnMut(ServerEvent) + Send + 'static,
    {
        if lock(&self.handlers)
            .insert(name, Slot::Idle(Box::new(handler)))
            .is_some()
        {
            debug!(?name, "replaced event handler");
        }
    }

    /// Remove the handler for `name`. Takes effect immediately, also when
    /// called from inside that handler.
    pub fn off(&self, name: EventName) {
        lock(&self.handlers).remove(&name);
    }

    /// Subscribe to the topic. Succeeds at most once per channel.
    ///
    /// Room events that arrive before the join reply are held back and
    /// dispatched, in order, right after the loop starts.
    ///
    /// # Errors
    ///
    /// - [`JoinError::Rejected`] if the server refused the join
    /// - [`JoinError::Timeout`] if no reply arrived within `join_timeout`
    /// - [`JoinError::Transport`] / [`JoinError::Closed`] if the transport failed
    /// - [`JoinError::AlreadyJoined`] on a second call
    pub async fn join(&self) -> std::result::Result<JoinAck, JoinError> {
        let pending = lock(&self.pending).take();
        let Some(Pending {
            mut transport,
            cmd_rx,
            shutdown_rx,
        }) = pending
        else {
            return Err(JoinError::AlreadyJoined);
        };

        let mut refs = RefCounter(0);
        let join_ref = refs.next();
        debug!(topic = %self.topic, join_ref = %join_ref, "joining topic");

        let mut backlog = VecDeque::new();
        let handshake = async {
            send_frame(transport.as_mut(), &Frame::join(&self.topic, join_ref.as_str()))
                .await
                .map_err(|e| JoinError::Transport(e.to_string()))?;
            await_join_reply(transport.as_mut(), &self.topic, &join_ref, &mut backlog).await
        };
        let result = match tokio::time::timeout(self.config.join_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(JoinError::Timeout),
        };

        if let Err(e) = result {
            warn!(topic = %self.topic, "join failed: {e}");
            self.state.closed.store(true, Ordering::Release);
            let _ = transport.close().await;
            return Err(e);
        }

        self.state.joined.store(true, Ordering::Release);
        info!(topic = %self.topic, "joined topic");

        let task = tokio::spawn(channel_loop(
            transport,
            LoopContext {
                topic: self.topic.clone(),
                join_ref,
                refs,
                action_prefix: self.config.action_prefix.clone(),
                handlers: Arc::clone(&self.handlers),
                state: Arc::clone(&self.state),
            },
            cmd_rx,
            shutdown_rx,
            self.config.heartbeat_interval,
            backlog,
        ));
        *lock(&self.task) = Some(task);

        Ok(JoinAck)
    }

    /// Queue an action for the server. Returns once it is queued.
    ///
    /// # Errors
    ///
    /// - [`RoomError::NotJoined`] before a successful join
    /// - [`RoomError::ChannelClosed`] after close or disconnect
    pub fn send(&self, action: ClientAction) -> Result<()> {
        if self.is_closed() {
            return Err(RoomError::ChannelClosed);
        }
        if !self.is_joined() {
            return Err(RoomError::NotJoined);
        }
        self.cmd_tx
            .send(action)
            .map_err(|_| RoomError::ChannelClosed)
    }

    /// Leave the topic and release the transport. Idempotent.
    ///
    /// Returns immediately; no event is dispatched after this call returns.
    /// Use [`shutdown`](Self::shutdown) to also wait for the loop to finish.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(topic = %self.topic, "closing channel");
        if let Some(tx) = lock(&self.shutdown_tx).take() {
            let _ = tx.send(());
        }
    }

    /// Close the channel and wait for the loop task to exit, aborting it
    /// after `shutdown_timeout`.
    pub async fn shutdown(&self) {
        self.close();
        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.config.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("channel loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("channel loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("channel loop aborted: {join_err}");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("topic", &self.topic)
            .field("joined", &self.is_joined())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        // No executor to drive a graceful leave from here; abort the loop.
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

// ── Handshake ───────────────────────────────────────────────────────

async fn send_frame(transport: &mut dyn Transport, frame: &Frame) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    transport.send(json).await
}

/// Read frames until the reply to `join_ref` arrives. Room events seen in
/// the meantime go to `backlog`.
async fn await_join_reply(
    transport: &mut dyn Transport,
    topic: &str,
    join_ref: &str,
    backlog: &mut VecDeque<Frame>,
) -> std::result::Result<(), JoinError> {
    loop {
        let text = match transport.recv().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(JoinError::Transport(e.to_string())),
            None => return Err(JoinError::Closed),
        };
        let frame = match serde_json::from_str::<Frame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to parse frame during join: {e}, raw: {text}");
                continue;
            }
        };
        if frame.topic != topic {
            debug!(topic = %frame.topic, "ignoring frame for other topic during join");
            continue;
        }
        if frame.event == PHX_REPLY && frame.msg_ref.as_deref() == Some(join_ref) {
            match frame.reply() {
                Some(reply) if reply.status == ReplyStatus::Ok => return Ok(()),
                Some(reply) => {
                    return Err(JoinError::Rejected {
                        response: reply.response,
                    })
                }
                None => {
                    warn!("malformed join reply: {}", frame.payload);
                    continue;
                }
            }
        }
        backlog.push_back(frame);
    }
}

// ── Loop ────────────────────────────────────────────────────────────

struct LoopContext {
    topic: String,
    join_ref: String,
    refs: RefCounter,
    action_prefix: String,
    handlers: Handlers,
    state: Arc<ChannelState>,
}

impl LoopContext {
    /// Route one inbound frame. Returns `false` when the topic is gone.
    fn handle_frame(&self, frame: Frame) -> bool {
        if frame.topic == HEARTBEAT_TOPIC {
            debug!("heartbeat reply");
            return true;
        }
        if frame.topic != self.topic {
            debug!(topic = %frame.topic, "ignoring frame for other topic");
            return true;
        }
        match frame.event.as_str() {
            PHX_REPLY => {
                match frame.reply() {
                    Some(reply) if reply.status == ReplyStatus::Error => {
                        warn!(msg_ref = ?frame.msg_ref, response = %reply.response, "push rejected");
                    }
                    _ => debug!(msg_ref = ?frame.msg_ref, "push acknowledged"),
                }
                true
            }
            PHX_CLOSE | PHX_ERROR => {
                warn!(event = %frame.event, "topic closed by server");
                self.dispatch(ServerEvent::Disconnected {
                    reason: Some(frame.event),
                });
                false
            }
            _ => {
                match ServerEvent::from_frame(&frame) {
                    Ok(event) => self.dispatch(event),
                    Err(e) => warn!(event = %frame.event, "unrecognized room event: {e}"),
                }
                true
            }
        }
    }

    /// Hand `event` to its handler. Nothing is dispatched once closed.
    fn dispatch(&self, event: ServerEvent) {
        if self.state.closed.load(Ordering::Acquire) {
            debug!(name = ?event.name(), "channel closed, dropping event");
            return;
        }
        let name = event.name();
        // Run the handler outside the lock so it may call `on`/`off`.
        let taken = match lock(&self.handlers).get_mut(&name) {
            Some(slot) => match std::mem::replace(slot, Slot::Running) {
                Slot::Idle(handler) => Some(handler),
                Slot::Running => None,
            },
            None => None,
        };
        let Some(mut handler) = taken else {
            debug!(?name, "no handler registered");
            return;
        };
        handler(event);
        // Put it back unless it was replaced or removed while running.
        if let Some(slot) = lock(&self.handlers).get_mut(&name) {
            if matches!(slot, Slot::Running) {
                *slot = Slot::Idle(handler);
            }
        }
    }

    /// Report a lost connection, then mark the channel closed.
    fn disconnected(&self, reason: Option<String>) {
        self.dispatch(ServerEvent::Disconnected { reason });
        self.state.closed.store(true, Ordering::Release);
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Background loop. Exits on local close, handle drop, topic close, or
/// transport failure.
async fn channel_loop(
    mut transport: Box<dyn Transport>,
    mut ctx: LoopContext,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientAction>,
    mut shutdown_rx: oneshot::Receiver<()>,
    heartbeat_interval: Option<Duration>,
    backlog: VecDeque<Frame>,
) {
    debug!(topic = %ctx.topic, "channel loop started");

    for frame in backlog {
        if !ctx.handle_frame(frame) {
            ctx.state.closed.store(true, Ordering::Release);
            let _ = transport.close().await;
            return;
        }
    }

    let mut heartbeat =
        heartbeat_interval.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(action) => {
                        debug!(event = action.event_name(), "pushing action");
                        let frame = Frame::push(
                            &ctx.topic,
                            ctx.join_ref.as_str(),
                            ctx.refs.next(),
                            &ctx.action_prefix,
                            &action,
                        );
                        if let Err(e) = send_frame(transport.as_mut(), &frame).await {
                            error!("transport send error: {e}");
                            ctx.disconnected(Some(format!("transport send error: {e}")));
                            break;
                        }
                    }
                    None => {
                        debug!("command channel closed, leaving topic");
                        leave(transport.as_mut(), &mut ctx).await;
                        break;
                    }
                }
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                leave(transport.as_mut(), &mut ctx).await;
                break;
            }

            _ = next_heartbeat(&mut heartbeat) => {
                if let Err(e) = send_frame(transport.as_mut(), &Frame::heartbeat(ctx.refs.next())).await {
                    error!("heartbeat send error: {e}");
                    ctx.disconnected(Some(format!("transport send error: {e}")));
                    break;
                }
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if !ctx.handle_frame(frame) {
                                ctx.state.closed.store(true, Ordering::Release);
                                let _ = transport.close().await;
                                break;
                            }
                        }
                        Err(e) => warn!("failed to parse frame: {e}, raw: {text}"),
                    },
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        ctx.disconnected(Some(format!("transport receive error: {e}")));
                        break;
                    }
                    None => {
                        debug!("transport closed by server");
                        ctx.disconnected(None);
                        break;
                    }
                }
            }
        }
    }

    debug!(topic = %ctx.topic, "channel loop exited");
}

async fn leave(transport: &mut dyn Transport, ctx: &mut LoopContext) {
    let frame = Frame::leave(&ctx.topic, ctx.join_ref.as_str(), ctx.refs.next());
    if let Err(e) = send_frame(transport, &frame).await {
        debug!("failed to send leave: {e}");
    }
    if let Err(e) = transport.close().await {
        debug!("failed to close transport: {e}");
    }
    ctx.state.closed.store(true, Ordering::Release);
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{PHX_JOIN, PHX_LEAVE};
    use async_trait::async_trait;

    const TOPIC: &str = "rps_room:R1";

    // ── Mock transport ──────────────────────────────────────────────

    type Incoming = Option<std::result::Result<String, RoomError>>;

    /// Transport fed by the test through an unbounded channel.
    struct MockTransport {
        incoming: mpsc::UnboundedReceiver<Incoming>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    struct MockServer {
        tx: mpsc::UnboundedSender<Incoming>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    impl MockServer {
        fn push(&self, frame: Frame) {
            self.tx
                .send(Some(Ok(serde_json::to_string(&frame).unwrap())))
                .unwrap();
        }

        fn push_raw(&self, item: Incoming) {
            self.tx.send(item).unwrap();
        }

        fn sent(&self) -> Vec<Frame> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|s| serde_json::from_str(s).unwrap())
                .collect()
        }
    }

    fn mock() -> (MockTransport, MockServer) {
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

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, frame: String) -> std::result::Result<(), RoomError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, RoomError>> {
            match self.incoming.recv().await {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> std::result::Result<(), RoomError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn server_frame(event: &str, payload: serde_json::Value) -> Frame {
        Frame {
            join_ref: Some("1".into()),
            msg_ref: None,
            topic: TOPIC.into(),
            event: event.into(),
            payload,
        }
    }

    fn reply(msg_ref: &str, status: &str, response: serde_json::Value) -> Frame {
        Frame {
            join_ref: Some("1".into()),
            msg_ref: Some(msg_ref.into()),
            topic: TOPIC.into(),
            event: PHX_REPLY.into(),
            payload: serde_json::json!({"status": status, "response": response}),
        }
    }

    fn config() -> ChannelConfig {
        ChannelConfig::default()
            .with_join_timeout(Duration::from_millis(200))
            .with_heartbeat_interval(None)
            .with_shutdown_timeout(Duration::from_millis(100))
    }

    fn recorder(
        channel: &SessionChannel,
        names: &[EventName],
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for name in names {
            let tx = tx.clone();
            channel.on(*name, move |event| {
                let _ = tx.send(event);
            });
        }
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("handler channel closed")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn join_sends_phx_join_and_succeeds_on_ok_reply() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());

        assert_eq!(channel.join().await.unwrap(), JoinAck);
        assert!(channel.is_joined());

        let sent = server.sent();
        assert_eq!(sent[0], Frame::join(TOPIC, "1"));
        assert_eq!(sent[0].event, PHX_JOIN);

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn join_error_reply_is_rejected_with_response() {
        let (transport, server) = mock();
        server.push(reply("1", "error", serde_json::json!({"reason": "no such room"})));
        let channel = SessionChannel::new(transport, TOPIC, config());

        match channel.join().await {
            Err(JoinError::Rejected { response }) => {
                assert_eq!(response["reason"], "no such room");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert!(!channel.is_joined());
        assert!(channel.is_closed());
        assert!(server.closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn join_times_out_without_reply() {
        let (transport, _server) = mock();
        let channel = SessionChannel::new(transport, TOPIC, config());
        assert!(matches!(channel.join().await, Err(JoinError::Timeout)));
    }

    #[tokio::test]
    async fn join_fails_when_transport_closes() {
        let (transport, server) = mock();
        server.push_raw(None);
        let channel = SessionChannel::new(transport, TOPIC, config());
        assert!(matches!(channel.join().await, Err(JoinError::Closed)));
    }

    #[tokio::test]
    async fn second_join_is_rejected() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        channel.join().await.unwrap();
        assert!(matches!(channel.join().await, Err(JoinError::AlreadyJoined)));
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn events_before_reply_are_dispatched_after_join() {
        let (transport, server) = mock();
        server.push(server_frame("game_started", serde_json::json!({"room_id": "R1"})));
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        let mut rx = recorder(&channel, &[EventName::GameStarted]);

        channel.join().await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            ServerEvent::GameStarted {
                room_id: "R1".into()
            }
        );
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn events_dispatch_in_arrival_order() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        let mut rx = recorder(&channel, &[EventName::GameStarted, EventName::PlayerPlayed]);
        channel.join().await.unwrap();

        server.push(server_frame("game_started", serde_json::json!({"room_id": "R1"})));
        server.push(server_frame("player_played", serde_json::json!({"by": "bob", "room_id": "R1"})));
        server.push(server_frame("player_played", serde_json::json!({"by": "amy", "room_id": "R1"})));

        assert_eq!(next(&mut rx).await.name(), EventName::GameStarted);
        assert!(matches!(next(&mut rx).await, ServerEvent::PlayerPlayed { by, .. } if by == "bob"));
        assert!(matches!(next(&mut rx).await, ServerEvent::PlayerPlayed { by, .. } if by == "amy"));
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_skipped() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        let mut rx = recorder(&channel, &[EventName::RoomClosed]);
        channel.join().await.unwrap();

        server.push_raw(Some(Ok("not json".into())));
        server.push(server_frame("chat", serde_json::json!({})));
        let mut other = server_frame("room_closed", serde_json::json!({"room_id": "R2"}));
        other.topic = "rps_room:R2".into();
        server.push(other);
        server.push(server_frame("room_closed", serde_json::json!({"room_id": "R1"})));

        assert_eq!(
            next(&mut rx).await,
            ServerEvent::RoomClosed {
                room_id: "R1".into()
            }
        );
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn send_before_join_fails() {
        let (transport, _server) = mock();
        let channel = SessionChannel::new(transport, TOPIC, config());
        assert!(matches!(
            channel.send(ClientAction::StartGame),
            Err(RoomError::NotJoined)
        ));
    }

    #[tokio::test]
    async fn send_pushes_frame_with_join_ref() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        channel.join().await.unwrap();

        channel
            .send(ClientAction::Play { mv: "rock".into() })
            .unwrap();
        wait_until(|| server.sent().len() >= 2).await;

        let push = &server.sent()[1];
        assert_eq!(push.event, "play");
        assert_eq!(push.topic, TOPIC);
        assert_eq!(push.join_ref.as_deref(), Some("1"));
        assert_eq!(push.msg_ref.as_deref(), Some("2"));
        assert_eq!(push.payload, serde_json::json!({"move": "rock"}));
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn close_sends_leave_and_closes_transport() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        channel.join().await.unwrap();

        channel.shutdown().await;
        assert!(channel.is_closed());
        assert!(server.closed.load(Ordering::Acquire));
        assert_eq!(server.sent().last().unwrap().event, PHX_LEAVE);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_send_after_close_fails() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        channel.join().await.unwrap();

        channel.close();
        channel.close();
        channel.shutdown().await;
        assert!(matches!(
            channel.send(ClientAction::StartGame),
            Err(RoomError::ChannelClosed)
        ));
        let leaves = server
            .sent()
            .iter()
            .filter(|f| f.event == PHX_LEAVE)
            .count();
        assert_eq!(leaves, 1);
    }

    #[tokio::test]
    async fn no_dispatch_after_close() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        let mut rx = recorder(&channel, &[EventName::GameStarted, EventName::Disconnected]);
        channel.join().await.unwrap();

        channel.close();
        server.push(server_frame("game_started", serde_json::json!({"room_id": "R1"})));
        channel.shutdown().await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_close_dispatches_disconnected() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        let mut rx = recorder(&channel, &[EventName::Disconnected]);
        channel.join().await.unwrap();

        server.push_raw(None);
        assert_eq!(
            next(&mut rx).await,
            ServerEvent::Disconnected { reason: None }
        );
        wait_until(|| channel.is_closed()).await;
        assert!(matches!(
            channel.send(ClientAction::StartGame),
            Err(RoomError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn transport_error_dispatches_disconnected_with_reason() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        let mut rx = recorder(&channel, &[EventName::Disconnected]);
        channel.join().await.unwrap();

        server.push_raw(Some(Err(RoomError::TransportReceive("reset".into()))));
        match next(&mut rx).await {
            ServerEvent::Disconnected { reason: Some(reason) } => {
                assert!(reason.contains("reset"));
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn phx_close_dispatches_disconnected() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(transport, TOPIC, config());
        let mut rx = recorder(&channel, &[EventName::Disconnected]);
        channel.join().await.unwrap();

        server.push(server_frame(PHX_CLOSE, serde_json::json!({})));
        assert_eq!(
            next(&mut rx).await,
            ServerEvent::Disconnected {
                reason: Some(PHX_CLOSE.into())
            }
        );
        wait_until(|| server.closed.load(Ordering::Acquire)).await;
    }

    #[tokio::test]
    async fn handler_can_be_replaced_from_inside_itself() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = Arc::new(SessionChannel::new(transport, TOPIC, config()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let weak = Arc::downgrade(&channel);
        let first_tx = tx.clone();
        channel.on(EventName::GameStarted, move |_| {
            let _ = first_tx.send("first");
            if let Some(channel) = weak.upgrade() {
                let tx = tx.clone();
                channel.on(EventName::GameStarted, move |_| {
                    let _ = tx.send("second");
                });
            }
        });
        channel.join().await.unwrap();

        server.push(server_frame("game_started", serde_json::json!({})));
        server.push(server_frame("game_started", serde_json::json!({})));

        let a = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!((a, b), (Some("first"), Some("second")));
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn handler_can_remove_itself() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = Arc::new(SessionChannel::new(transport, TOPIC, config()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let weak = Arc::downgrade(&channel);
        channel.on(EventName::GameStarted, move |_| {
            let _ = tx.send(());
            if let Some(channel) = weak.upgrade() {
                channel.off(EventName::GameStarted);
            }
        });
        let mut closed = recorder(&channel, &[EventName::RoomClosed]);
        channel.join().await.unwrap();

        server.push(server_frame("game_started", serde_json::json!({})));
        server.push(server_frame("game_started", serde_json::json!({})));
        server.push(server_frame("room_closed", serde_json::json!({})));

        // room_closed arrives after both game_started frames were handled.
        next(&mut closed).await;
        assert_eq!(rx.try_recv(), Ok(()));
        assert!(rx.try_recv().is_err());
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn action_prefix_is_applied_to_pushes() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(
            transport,
            TOPIC,
            config().with_action_prefix(crate::protocol::LEGACY_ACTION_PREFIX),
        );
        channel.join().await.unwrap();

        channel.send(ClientAction::StartGame).unwrap();
        channel
            .send(ClientAction::Play { mv: "rock".into() })
            .unwrap();
        wait_until(|| server.sent().len() >= 3).await;

        let sent = server.sent();
        assert_eq!(sent[1].event, "rps_start_game");
        assert_eq!(sent[2].event, "rps_play");
        assert_eq!(sent[2].payload, serde_json::json!({"move": "rock"}));
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_is_sent_on_interval() {
        let (transport, server) = mock();
        server.push(reply("1", "ok", serde_json::json!({})));
        let channel = SessionChannel::new(
            transport,
            TOPIC,
            config().with_heartbeat_interval(Some(Duration::from_millis(20))),
        );
        channel.join().await.unwrap();

        wait_until(|| {
            server
                .sent()
                .iter()
                .any(|f| f.topic == HEARTBEAT_TOPIC && f.join_ref.is_none())
        })
        .await;
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.topic_prefix, DEFAULT_TOPIC_PREFIX);
        assert_eq!(config.action_prefix, "");
        assert_eq!(config.join_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert!(ChannelConfig::default()
            .with_heartbeat_interval(Some(Duration::ZERO))
            .heartbeat_interval
            .is_none());
    }

    #[tokio::test]
    async fn debug_impl_shows_topic() {
        let (transport, _server) = mock();
        let channel = SessionChannel::new(transport, TOPIC, config());
        let debug = format!("{channel:?}");
        assert!(debug.contains("rps_room:R1"));
        assert!(debug.contains("joined: false"));
    }
}
