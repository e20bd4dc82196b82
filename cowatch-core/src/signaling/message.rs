//! Signaling Messages
//!
//! Everything participants say to each other through the relay.

use serde::{Deserialize, Serialize};

use crate::relay::Lane;
use crate::sync::{MediaDescriptor, PlaybackState};

/// Opaque session description produced by a media backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

/// ICE candidate plus the metadata needed to apply it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// One fragment of a chunked transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub media_item_id: String,
    pub sequence: u32,
    pub total_chunks: u32,
    /// Declared length of the reassembled payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    pub bytes_base64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayPayload {
    pub position_seconds: f64,
    pub at_timestamp: f64,
}

/// Shared by pause and seek
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionPayload {
    pub position_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSelectedPayload {
    pub descriptor: MediaDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub playback_state: PlaybackState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub text: String,
    pub sent_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoiceStatePayload {
    pub muted: bool,
    pub speaking: bool,
}

/// Messages exchanged between participants
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    // === Peer negotiation ===
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),

    // === Bulk transfer ===
    Chunk(ChunkPayload),

    // === Playback commands (from host) ===
    PlaybackPlay(PlayPayload),
    PlaybackPause(PositionPayload),
    PlaybackSeek(PositionPayload),
    MediaSelected(MediaSelectedPayload),

    // === Resync ===
    StateSnapshotRequest,
    StateSnapshot(SnapshotPayload),

    // === Room chatter ===
    Chat(ChatPayload),
    VoiceJoin,
    VoiceLeave,
    VoiceState(VoiceStatePayload),

    /// A `type` this build does not know; kept for forward compatibility
    Unknown {
        kind: String,
        payload: serde_json::Value,
    },
}

impl SignalMessage {
    /// The `type` tag used on the wire
    pub fn kind(&self) -> &str {
        match self {
            SignalMessage::Offer(_) => "offer",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::IceCandidate(_) => "ice-candidate",
            SignalMessage::Chunk(_) => "chunk",
            SignalMessage::PlaybackPlay(_) => "playback-play",
            SignalMessage::PlaybackPause(_) => "playback-pause",
            SignalMessage::PlaybackSeek(_) => "playback-seek",
            SignalMessage::MediaSelected(_) => "media-selected",
            SignalMessage::StateSnapshotRequest => "state-snapshot-request",
            SignalMessage::StateSnapshot(_) => "state-snapshot",
            SignalMessage::Chat(_) => "chat",
            SignalMessage::VoiceJoin => "voice-join",
            SignalMessage::VoiceLeave => "voice-leave",
            SignalMessage::VoiceState(_) => "voice-state",
            SignalMessage::Unknown { kind, .. } => kind,
        }
    }

    /// Check if this is a playback command that requires host privileges
    pub fn requires_host(&self) -> bool {
        matches!(
            self,
            SignalMessage::PlaybackPlay(_)
                | SignalMessage::PlaybackPause(_)
                | SignalMessage::PlaybackSeek(_)
                | SignalMessage::MediaSelected(_)
                | SignalMessage::StateSnapshot(_)
        )
    }

    /// Relay lane this message travels on
    pub fn lane(&self) -> Lane {
        match self {
            SignalMessage::Chunk(_) => Lane::Bulk,
            _ => Lane::Control,
        }
    }
}

/// The envelope every signaling message travels in
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub room_id: String,
    pub from: String,
    /// Unicast target; `None` means everyone in the room
    pub to: Option<String>,
    pub message: SignalMessage,
}

impl Envelope {
    pub fn new(
        room_id: impl Into<String>,
        from: impl Into<String>,
        to: Option<String>,
        message: SignalMessage,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            from: from.into(),
            to,
            message,
        }
    }
}
