//! Relay wire frames
//!
//! JSON text frames tagged by `op`. Signaling envelopes ride inside as opaque
//! strings; the relay never looks into them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Lane;
use crate::directory::{DirectoryError, Participant};
use crate::sync::PlaybackState;

/// Client to relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        token: String,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },
    Leave,
    Signal {
        /// Unicast target, broadcast when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default)]
        lane: Lane,
        envelope: String,
    },
    PublishState {
        playback: PlaybackState,
    },
    #[serde(rename_all = "camelCase")]
    TransferHost {
        user_id: String,
    },
}

impl ClientFrame {
    pub fn lane(&self) -> Lane {
        match self {
            ClientFrame::Signal { lane, .. } => *lane,
            _ => Lane::Control,
        }
    }
}

/// Relay to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Joined {
        room_id: String,
        user_id: String,
        roster: Vec<Participant>,
        host_id: String,
        playback: PlaybackState,
    },
    #[serde(rename_all = "camelCase")]
    Roster {
        roster: Vec<Participant>,
        host_id: String,
        playback: PlaybackState,
    },
    Signal {
        from: String,
        envelope: String,
    },
    Error {
        kind: RelayErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayErrorKind {
    AuthFailure,
    RoomNotFound,
    NotHost,
    BadFrame,
    NotJoined,
    Unavailable,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("{0} is not the host")]
    NotHost(String),

    #[error("bad frame: {0}")]
    BadFrame(String),

    #[error("join the room first")]
    NotJoined,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("connection closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl RelayError {
    /// Kind reported to the client, if this error is reportable
    pub fn kind(&self) -> Option<RelayErrorKind> {
        match self {
            RelayError::AuthFailure(_) => Some(RelayErrorKind::AuthFailure),
            RelayError::RoomNotFound(_) => Some(RelayErrorKind::RoomNotFound),
            RelayError::NotHost(_) => Some(RelayErrorKind::NotHost),
            RelayError::BadFrame(_) => Some(RelayErrorKind::BadFrame),
            RelayError::NotJoined => Some(RelayErrorKind::NotJoined),
            RelayError::Unavailable(_) => Some(RelayErrorKind::Unavailable),
            RelayError::Closed | RelayError::WebSocket(_) => None,
        }
    }

    pub fn to_frame(&self) -> Option<ServerFrame> {
        self.kind().map(|kind| ServerFrame::Error {
            kind,
            message: self.to_string(),
        })
    }
}

impl From<DirectoryError> for RelayError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::RoomNotFound(room) => RelayError::RoomNotFound(room),
            DirectoryError::NotHost(user) => RelayError::NotHost(user),
            DirectoryError::UnknownParticipant(user) => {
                RelayError::BadFrame(format!("unknown participant {}", user))
            }
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::BadFrame(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_wire_shape() {
        let join: ClientFrame = serde_json::from_str(
            r#"{"op":"join","roomId":"ABCD2345","token":"t","displayName":"Bob"}"#,
        )
        .unwrap();
        assert_eq!(
            join,
            ClientFrame::Join {
                room_id: "ABCD2345".into(),
                token: "t".into(),
                display_name: "Bob".into(),
                avatar: None,
            }
        );

        let signal: ClientFrame =
            serde_json::from_str(r#"{"op":"signal","envelope":"{}"}"#).unwrap();
        assert_eq!(signal.lane(), Lane::Control);

        let text = serde_json::to_string(&ClientFrame::TransferHost {
            user_id: "bob".into(),
        })
        .unwrap();
        assert_eq!(text, r#"{"op":"transfer-host","userId":"bob"}"#);
        assert_eq!(serde_json::to_string(&ClientFrame::Leave).unwrap(), r#"{"op":"leave"}"#);
    }

    #[test]
    fn test_error_frames() {
        let frame = RelayError::RoomNotFound("ZZZZ".into()).to_frame().unwrap();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "error");
        assert_eq!(json["kind"], "room-not-found");

        assert!(RelayError::Closed.to_frame().is_none());
    }
}
