// Error types for the relay and its client.
//
// `ConnError` is the single fault type of a connection: anything a state
// handler, a cooperative task or the transport returns ends up here, and
// `drive` turns it into a teardown with the matching disconnect reason. Faults
// never cross connection boundaries.
//
// `CommandRejected` is not a connection fault. A rejected command is logged and
// dropped; the connection keeps going.

use std::io;

use lockstep_protocol::{CommandKind, DisconnectReason, FrameError};

/// Fatal condition on one connection.
#[derive(thiserror::Error, Debug)]
pub enum ConnError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("kind {kind} is not legal in state {state}")]
    IllegalKind { kind: u8, state: String },
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("malformed message body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// Session-level refusal (bad username, server full, ...).
    #[error("refused: {0:?}")]
    Refused(DisconnectReason),
    /// The peer sent the out-of-band disconnect notice.
    #[error("peer disconnected: {0:?}")]
    PeerClosed(DisconnectReason),
    /// The connection was closed from this side.
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Await(#[from] AwaitError),
    #[error("internal fault: {0}")]
    Internal(&'static str),
}

impl ConnError {
    /// Reason code reported to the peer when this fault closes the connection.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            ConnError::Frame(_)
            | ConnError::IllegalKind { .. }
            | ConnError::UnknownKind(_)
            | ConnError::Body(_)
            | ConnError::Malformed(_) => DisconnectReason::ProtocolFault,
            ConnError::Refused(reason) => *reason,
            ConnError::PeerClosed(_) | ConnError::Closed => DisconnectReason::Quit,
            ConnError::Io(_) | ConnError::Await(_) | ConnError::Internal(_) => {
                DisconnectReason::InternalFault
            }
        }
    }

    /// Orderly endings that are not worth a warning.
    pub fn is_benign(&self) -> bool {
        match self {
            ConnError::PeerClosed(_) | ConnError::Closed => true,
            ConnError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Misuse of the cooperative await layer.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitError {
    #[error("a wait is already outstanding on this handler")]
    AlreadyWaiting,
}

/// Why a submitted command was not appended to any log.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandRejected {
    #[error("{0:?} may only be issued by the relay")]
    ServerOnly(CommandKind),
    #[error("{0:?} needs a map scope")]
    MapKindWithoutMap(CommandKind),
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("sender is not playing")]
    NotPlaying,
    #[error("arbiters cannot issue commands")]
    Arbiter,
}
