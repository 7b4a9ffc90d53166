//! Error types for the room client.

use thiserror::Error;

use crate::room::RoundState;

/// Failure of the channel join handshake.
///
/// A `JoinError` is terminal for the session attempt: no [`RoomSession`](crate::RoomSession)
/// is constructed and nothing is retried.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The server answered the join with an `error` status (room not found,
    /// room already closed, ...). The response payload is passed through as-is.
    #[error("join rejected by server: {response}")]
    Rejected {
        /// Raw `response` object from the server's reply.
        response: serde_json::Value,
    },

    /// No reply to the join arrived within the configured timeout.
    #[error("join timed out")]
    Timeout,

    /// `join` was called on a channel that has already attempted to join.
    #[error("channel already joined")]
    AlreadyJoined,

    /// The transport failed while the handshake was in flight.
    #[error("transport error during join: {0}")]
    Transport(String),

    /// The transport closed before the server replied.
    #[error("transport closed during join")]
    Closed,
}

/// Errors returned by room actions and the session channel.
///
/// None of these mutate the room model; all are recoverable by the caller.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Only the room owner may request a round start.
    #[error("only the room owner can start a round")]
    NotOwner,

    /// The move is not part of the configured move set.
    #[error("invalid move: {mv:?}")]
    InvalidMove {
        /// The rejected move.
        mv: String,
    },

    /// A move was committed while no round is in progress.
    #[error("no round in progress (round is {round:?})")]
    RoundNotActive {
        /// Round state at the time of the call.
        round: RoundState,
    },

    /// The channel has not completed its join handshake.
    #[error("channel not joined")]
    NotJoined,

    /// The channel was closed (locally or by the server).
    #[error("channel closed")]
    ChannelClosed,

    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// The socket endpoint is not a `ws://` or `wss://` URL.
    #[error("invalid socket endpoint: {0}")]
    InvalidEndpoint(String),

    /// The server refused the socket upgrade, typically because it rejected
    /// the room connect parameters.
    #[error("socket connection refused with HTTP {status}")]
    SocketRefused {
        /// HTTP status of the refused upgrade.
        status: u16,
    },

    /// Failed to serialize or deserialize a frame.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for room client operations.
pub type Result<T> = std::result::Result<T, RoomError>;
