//! Session errors

use thiserror::Error;

use crate::directory::DirectoryError;
use crate::peer::{BackendError, PeerError};
use crate::relay::{RelayError, RelayErrorKind};
use crate::signaling::DecodeError;
use crate::sync::SyncError;
use crate::transfer::TransferError;

/// Errors surfaced by a room session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("peer {0} is unreachable")]
    PeerUnreachable(String),

    #[error("transfer {media_item_id} abandoned ({received}/{total} chunks)")]
    TransferAbandoned {
        media_item_id: String,
        received: u32,
        total: u32,
    },

    #[error("could not decode message: {0}")]
    Decode(String),

    #[error("stale signal: {0}")]
    StaleSignal(String),

    #[error("only the host can do that")]
    NotHost,

    #[error("not in a room")]
    NotInRoom,

    #[error("no snapshot from host after {attempts} attempts")]
    NotSynchronized { attempts: u32 },

    #[error("{0} is already flowing over a direct link")]
    DirectMediaActive(String),

    #[error("no media selected")]
    NoMedia,

    #[error("invalid position: {0}")]
    InvalidPosition(f64),

    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    #[error("media backend: {0}")]
    Backend(String),

    #[error("relay: {0}")]
    Transport(String),
}

impl SessionError {
    /// Needs the user to do something; retrying will not help
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::AuthFailure(_) | SessionError::RoomNotFound(_))
    }
}

impl From<SyncError> for SessionError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotHost => SessionError::NotHost,
            SyncError::NoMedia => SessionError::NoMedia,
            SyncError::InvalidPosition(p) => SessionError::InvalidPosition(p),
        }
    }
}

impl From<PeerError> for SessionError {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::StaleSignal { .. } => SessionError::StaleSignal(e.to_string()),
            PeerError::Unreachable(remote) => SessionError::PeerUnreachable(remote),
            PeerError::Backend(e) => SessionError::Backend(e.to_string()),
        }
    }
}

impl From<BackendError> for SessionError {
    fn from(e: BackendError) -> Self {
        SessionError::Backend(e.to_string())
    }
}

impl From<TransferError> for SessionError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Abandoned {
                media_item_id,
                received,
                total,
            } => SessionError::TransferAbandoned {
                media_item_id,
                received,
                total,
            },
            TransferError::NotHost => SessionError::NotHost,
            TransferError::DirectMediaActive(id) => SessionError::DirectMediaActive(id),
            other => SessionError::Decode(other.to_string()),
        }
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        SessionError::Decode(e.to_string())
    }
}

impl From<DirectoryError> for SessionError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::RoomNotFound(room) => SessionError::RoomNotFound(room),
            DirectoryError::NotHost(_) => SessionError::NotHost,
            DirectoryError::UnknownParticipant(user) => SessionError::UnknownParticipant(user),
        }
    }
}

impl From<RelayError> for SessionError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::AuthFailure(msg) => SessionError::AuthFailure(msg),
            RelayError::RoomNotFound(room) => SessionError::RoomNotFound(room),
            RelayError::NotHost(_) => SessionError::NotHost,
            RelayError::NotJoined => SessionError::NotInRoom,
            other => SessionError::Transport(other.to_string()),
        }
    }
}

impl SessionError {
    /// Map an `error` frame from the relay
    pub fn from_relay(kind: RelayErrorKind, message: String) -> Self {
        match kind {
            RelayErrorKind::AuthFailure => SessionError::AuthFailure(message),
            RelayErrorKind::RoomNotFound => SessionError::RoomNotFound(message),
            RelayErrorKind::NotHost => SessionError::NotHost,
            RelayErrorKind::NotJoined => SessionError::NotInRoom,
            RelayErrorKind::BadFrame | RelayErrorKind::Unavailable => {
                SessionError::Transport(message)
            }
        }
    }
}
