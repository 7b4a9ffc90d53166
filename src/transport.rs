//! Transport abstraction for the room channel.
//!
//! The [`Transport`] trait is a bidirectional text frame pipe between the
//! client and the server. Each frame is one serialized channel message; framing
//! (WebSocket frames, length prefixes, ...) is the implementation's business.
//!
//! # Connection Setup
//!
//! Connecting is not part of this trait. Build a connected transport
//! externally (see [`RoomInfo::socket_url`](crate::protocol::RoomInfo::socket_url)
//! for the endpoint), then hand it to `RoomSession::join`.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use rps_room_client::error::RoomError;
//! use rps_room_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: String) -> Result<(), RoomError> {
//!         // Write one JSON frame
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, RoomError>> {
//!         // Read the next JSON frame; None on clean close
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), RoomError> {
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::RoomError;

/// A bidirectional text frame transport.
///
/// The trait is object-safe; the session channel stores it as
/// `Box<dyn Transport>` between construction and join.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe: it is polled inside
/// `tokio::select!` and a cancelled call must not lose a frame.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::TransportSend`] if the frame could not be written.
    async fn send(&mut self, frame: String) -> Result<(), RoomError>;

    /// Receive the next text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))` for a complete frame
    /// - `Some(Err(e))` on a transport error
    /// - `None` when the server closed the connection cleanly
    async fn recv(&mut self) -> Option<Result<String, RoomError>>;

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Resources should be
    /// released regardless.
    async fn close(&mut self) -> Result<(), RoomError>;
}
