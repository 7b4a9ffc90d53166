//! WebSocket transport for the room socket, over `tokio-tungstenite`.
//!
//! One channel frame travels per text message. Besides moving text, the
//! transport owns the socket-level side of the Phoenix connection:
//!
//! - the connect URL carries the room parameters and serializer version
//!   (see [`RoomInfo::socket_url`])
//! - an upgrade the server refuses (its socket `connect` returned an error)
//!   surfaces as [`RoomError::SocketRefused`] with the HTTP status
//! - the server's close code decides how the stream ends: `1000`/`1001` is
//!   a clean end (`None`), anything else is reported once as an error
//!   carrying the code and reason
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), rps_room_client::RoomError> {
//! use rps_room_client::{RoomInfo, WebSocketTransport};
//!
//! let info = RoomInfo::new("R1", "alice", true);
//! let transport =
//!     WebSocketTransport::connect("ws://localhost:4000/socket/websocket", &info).await?;
//! # drop(transport);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::error::RoomError;
use crate::protocol::RoomInfo;
use crate::transport::Transport;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Underlying stream type, public so callers can build one themselves and
/// hand it to [`WebSocketTransport::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Open,
    /// The server sent a close frame or dropped the connection.
    PeerClosed,
    /// [`Transport::close`] was called.
    Closed,
}

/// A [`Transport`] over the room's WebSocket.
///
/// For custom TLS, proxies, or extra headers, connect the stream yourself
/// and use [`from_stream`](Self::from_stream).
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe; a dropped `recv` future does not
/// lose a message.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    state: SocketState,
}

impl WebSocketTransport {
    /// Open the room socket at `endpoint` with `info` as connect
    /// parameters, waiting at most 10 seconds.
    ///
    /// # Errors
    ///
    /// See [`connect_url`](Self::connect_url).
    pub async fn connect(endpoint: &str, info: &RoomInfo) -> Result<Self, RoomError> {
        Self::connect_url(&info.socket_url(endpoint), DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Open a socket at a complete URL, query string included.
    ///
    /// # Errors
    ///
    /// - [`RoomError::InvalidEndpoint`] for anything but a `ws://` or `wss://` URL
    /// - [`RoomError::SocketRefused`] if the server answered the upgrade with
    ///   an HTTP error
    /// - [`RoomError::Timeout`] if `timeout` elapses first
    /// - [`RoomError::Io`] for network failures, with the I/O error kind kept
    pub async fn connect_url(url: &str, timeout: Duration) -> Result<Self, RoomError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(RoomError::InvalidEndpoint(url.to_string()));
        }
        tracing::debug!(url = %url, "opening room socket");

        let (stream, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| RoomError::Timeout)?
                .map_err(connect_error)?;

        tracing::info!(url = %url, "room socket open");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-upgraded stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            state: SocketState::Open,
        }
    }
}

fn connect_error(err: WsError) -> RoomError {
    match err {
        WsError::Http(response) => RoomError::SocketRefused {
            status: response.status().as_u16(),
        },
        WsError::Url(e) => RoomError::InvalidEndpoint(e.to_string()),
        WsError::Io(io) => RoomError::Io(io),
        other => RoomError::Io(std::io::Error::other(other)),
    }
}

/// `None` for a clean end of the socket, otherwise the error to report.
fn close_outcome(frame: Option<CloseFrame>) -> Option<RoomError> {
    let frame = frame?;
    if matches!(frame.code, CloseCode::Normal | CloseCode::Away) {
        return None;
    }
    Some(RoomError::TransportReceive(format!(
        "socket closed with code {}: {}",
        u16::from(frame.code),
        frame.reason.as_str()
    )))
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<(), RoomError> {
        if self.state != SocketState::Open {
            return Err(RoomError::TransportClosed);
        }
        match self.stream.send(Message::Text(frame.into())).await {
            Ok(()) => Ok(()),
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                self.state = SocketState::PeerClosed;
                Err(RoomError::TransportClosed)
            }
            Err(e) => Err(RoomError::TransportSend(e.to_string())),
        }
    }

    async fn recv(&mut self) -> Option<Result<String, RoomError>> {
        if self.state != SocketState::Open {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    self.state = SocketState::PeerClosed;
                    return match close_outcome(frame) {
                        Some(err) => {
                            tracing::warn!("room socket closed by server: {err}");
                            Some(Err(err))
                        }
                        None => {
                            tracing::debug!("room socket closed by server");
                            None
                        }
                    };
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::warn!("unexpected binary frame on room socket, skipping");
                }
                // Pongs are queued by tungstenite itself.
                Some(Ok(_)) => {}
                None | Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    self.state = SocketState::PeerClosed;
                    return None;
                }
                Some(Err(e)) => return Some(Err(RoomError::TransportReceive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), RoomError> {
        match std::mem::replace(&mut self.state, SocketState::Closed) {
            SocketState::Closed => Ok(()),
            // tungstenite already answered the server's close frame.
            SocketState::PeerClosed => Ok(()),
            SocketState::Open => match self.stream.close(None).await {
                Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(RoomError::TransportSend(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http;

    type ServerStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Accept one connection, report its request URI, and run `handler` on it.
    async fn serve_once<F, Fut>(handler: F) -> (String, oneshot::Receiver<String>)
    where
        F: FnOnce(ServerStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, uri_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_hdr_async(tcp, |req: &Request, resp: Response| {
                let _ = uri_tx.send(req.uri().to_string());
                Ok::<_, ErrorResponse>(resp)
            })
            .await
            .unwrap();
            handler(ws).await;
        });

        (format!("ws://{addr}/socket/websocket"), uri_rx)
    }

    /// Answer one upgrade request with `status` instead of switching protocols.
    async fn refuse_once(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ = tokio_tungstenite::accept_hdr_async(tcp, move |_: &Request, _: Response| {
                Err::<Response, ErrorResponse>(
                    http::Response::builder().status(status).body(None).unwrap(),
                )
            })
            .await;
        });

        format!("ws://{addr}/socket/websocket")
    }

    async fn drain(mut ws: ServerStream) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    fn info() -> RoomInfo {
        RoomInfo::new("R1", "alice", true)
    }

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[test]
    fn normal_and_away_closes_are_clean() {
        for code in [CloseCode::Normal, CloseCode::Away] {
            let frame = CloseFrame {
                code,
                reason: "bye".into(),
            };
            assert!(close_outcome(Some(frame)).is_none());
        }
        assert!(close_outcome(None).is_none());
    }

    #[tokio::test]
    async fn non_websocket_urls_are_rejected_up_front() {
        for url in ["not a url", "http://localhost:4000/socket/websocket"] {
            let err = WebSocketTransport::connect_url(url, Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, RoomError::InvalidEndpoint(_)), "{url}: {err:?}");
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_an_io_error() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1/socket/websocket", &info())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Io(_)));
    }

    #[tokio::test]
    async fn connect_times_out() {
        // TEST-NET-1, never routable.
        let err = WebSocketTransport::connect_url("ws://192.0.2.1:1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Timeout));
    }

    #[tokio::test]
    async fn connect_sends_room_params() {
        let (endpoint, uri) = serve_once(drain).await;

        let mut transport = WebSocketTransport::connect(&endpoint, &info())
            .await
            .unwrap();
        assert_eq!(
            uri.await.unwrap(),
            "/socket/websocket?room_id=R1&player_name=alice&is_owner=true&vsn=2.0.0"
        );
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn refused_upgrade_reports_http_status() {
        let endpoint = refuse_once(403).await;
        let err = WebSocketTransport::connect(&endpoint, &info())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::SocketRefused { status: 403 }), "{err:?}");
    }

    #[tokio::test]
    async fn frames_flow_both_ways_until_clean_close() {
        let (endpoint, _uri) = serve_once(|mut ws| async move {
            if let Some(Ok(Message::Text(join))) = ws.next().await {
                assert!(join.as_str().contains("phx_join"));
                ws.send(Message::Text(
                    r#"["1","1","rps_room:R1","phx_reply",{"status":"ok","response":{}}]"#.into(),
                ))
                .await
                .unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&endpoint, &info())
            .await
            .unwrap();
        transport
            .send(r#"["1","1","rps_room:R1","phx_join",{}]"#.to_string())
            .await
            .unwrap();

        let reply = transport.recv().await.unwrap().unwrap();
        assert!(reply.contains("phx_reply"));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn abnormal_close_is_reported_once() {
        let (endpoint, _uri) = serve_once(|mut ws| async move {
            ws.close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "room closed".into(),
            }))
            .await
            .unwrap();
            drain(ws).await;
        })
        .await;

        let mut transport = WebSocketTransport::connect(&endpoint, &info())
            .await
            .unwrap();
        match transport.recv().await {
            Some(Err(RoomError::TransportReceive(reason))) => {
                assert!(reason.contains("1008"), "{reason}");
                assert!(reason.contains("room closed"), "{reason}");
            }
            other => panic!("expected close error, got {other:?}"),
        }
        assert!(transport.recv().await.is_none());
        assert!(matches!(
            transport.send("[]".to_string()).await,
            Err(RoomError::TransportClosed)
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn binary_frames_are_skipped() {
        let (endpoint, _uri) = serve_once(|mut ws| async move {
            ws.send(Message::Binary(vec![0x83, 0x6a].into()))
                .await
                .unwrap();
            ws.send(Message::Text("[null,null,\"phoenix\",\"x\",{}]".into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&endpoint, &info())
            .await
            .unwrap();
        let text = transport.recv().await.unwrap().unwrap();
        assert!(text.starts_with("[null"));
    }

    #[tokio::test]
    async fn send_after_close_fails_and_close_is_idempotent() {
        let (endpoint, _uri) = serve_once(drain).await;

        let mut transport = WebSocketTransport::connect(&endpoint, &info())
            .await
            .unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("[]".to_string()).await.unwrap_err();
        assert!(matches!(err, RoomError::TransportClosed));
        assert!(transport.recv().await.is_none());
    }
}
