//! FFI types exposed via uniffi

use crate::directory::Participant as InternalParticipant;
use crate::error::SessionError;
use crate::peer::{StreamHandle, TrackKind};
use crate::signaling::{IceCandidate, VoiceStatePayload};
use crate::sync::{
    MediaDescriptor, MediaKind, PlaybackState as InternalPlaybackState, PlayerCommand,
};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Invalid room code: {0}")]
    InvalidRoomCode(String),

    #[error("Not in a room")]
    NotInRoom,

    #[error("Already in a room")]
    AlreadyInRoom,

    #[error("Not the host")]
    NotHost,

    #[error("No media selected")]
    NoMedia,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Media error: {0}")]
    MediaError(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::AuthFailure(msg) => CoreError::AuthFailure(msg),
            SessionError::RoomNotFound(room) => CoreError::RoomNotFound(room),
            SessionError::NotHost => CoreError::NotHost,
            SessionError::NotInRoom => CoreError::NotInRoom,
            SessionError::NoMedia => CoreError::NoMedia,
            SessionError::InvalidPosition(_) | SessionError::UnknownParticipant(_) => {
                CoreError::InvalidArgument(e.to_string())
            }
            SessionError::TransferAbandoned { .. } | SessionError::DirectMediaActive(_) => {
                CoreError::TransferFailed(e.to_string())
            }
            SessionError::PeerUnreachable(_)
            | SessionError::StaleSignal(_)
            | SessionError::Backend(_) => CoreError::MediaError(e.to_string()),
            SessionError::Decode(_)
            | SessionError::NotSynchronized { .. }
            | SessionError::Transport(_) => CoreError::NetworkError(e.to_string()),
        }
    }
}

impl From<uniffi::UnexpectedUniFFICallbackError> for CoreError {
    fn from(e: uniffi::UnexpectedUniFFICallbackError) -> Self {
        CoreError::MediaError(e.reason)
    }
}

/// Kind of media the room is watching
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MediaSource {
    None,
    Screen,
    File,
    Stream,
}

impl From<MediaKind> for MediaSource {
    fn from(k: MediaKind) -> Self {
        match k {
            MediaKind::None => MediaSource::None,
            MediaKind::Screen => MediaSource::Screen,
            MediaKind::File => MediaSource::File,
            MediaKind::Stream => MediaSource::Stream,
        }
    }
}

impl From<MediaSource> for MediaKind {
    fn from(s: MediaSource) -> Self {
        match s {
            MediaSource::None => MediaKind::None,
            MediaSource::Screen => MediaKind::Screen,
            MediaSource::File => MediaKind::File,
            MediaSource::Stream => MediaKind::Stream,
        }
    }
}

/// Selected media exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct MediaInfo {
    pub source: MediaSource,
    pub name: String,
    pub size: u64,
    /// URL, transfer id or track id, depending on the source
    pub locator: String,
}

impl From<MediaDescriptor> for MediaInfo {
    fn from(d: MediaDescriptor) -> Self {
        Self {
            source: d.kind.into(),
            name: d.name,
            size: d.size,
            locator: d.locator,
        }
    }
}

impl From<MediaInfo> for MediaDescriptor {
    fn from(m: MediaInfo) -> Self {
        Self {
            kind: m.source.into(),
            name: m.name,
            size: m.size,
            locator: m.locator,
        }
    }
}

/// Playback state exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct PlaybackState {
    pub media: MediaInfo,
    pub is_playing: bool,
    pub position_seconds: f64,
    /// Host timestamp of `position_seconds`, seconds since UNIX epoch
    pub last_updated: f64,
}

impl From<InternalPlaybackState> for PlaybackState {
    fn from(p: InternalPlaybackState) -> Self {
        Self {
            media: p.media_descriptor.into(),
            is_playing: p.is_playing,
            position_seconds: p.position_seconds,
            last_updated: p.last_updated,
        }
    }
}

/// What the local player should do next
#[derive(Debug, Clone, PartialEq, uniffi::Enum)]
pub enum PlayerAction {
    Load { media: MediaInfo },
    Unload,
    SeekTo { position_seconds: f64 },
    Play,
    Pause,
}

impl From<PlayerCommand> for PlayerAction {
    fn from(c: PlayerCommand) -> Self {
        match c {
            PlayerCommand::Load(d) => PlayerAction::Load { media: d.into() },
            PlayerCommand::Unload => PlayerAction::Unload,
            PlayerCommand::SeekTo(position_seconds) => PlayerAction::SeekTo { position_seconds },
            PlayerCommand::Play => PlayerAction::Play,
            PlayerCommand::Pause => PlayerAction::Pause,
        }
    }
}

/// Participant exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub is_host: bool,
    pub is_connected: bool,
    pub joined_at: f64,
}

impl From<&InternalParticipant> for Participant {
    fn from(p: &InternalParticipant) -> Self {
        Self {
            user_id: p.user_id.clone(),
            display_name: p.display_name.clone(),
            avatar: p.avatar.clone(),
            is_host: p.is_host,
            is_connected: p.is_connected(),
            joined_at: p.joined_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, uniffi::Record)]
pub struct VoiceState {
    pub muted: bool,
    pub speaking: bool,
}

impl From<VoiceStatePayload> for VoiceState {
    fn from(v: VoiceStatePayload) -> Self {
        Self {
            muted: v.muted,
            speaking: v.speaking,
        }
    }
}

impl From<VoiceState> for VoiceStatePayload {
    fn from(v: VoiceState) -> Self {
        Self {
            muted: v.muted,
            speaking: v.speaking,
        }
    }
}

/// ICE candidate exchanged with the platform media stack
#[derive(Debug, Clone, uniffi::Record)]
pub struct IceCandidateInfo {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

impl From<&IceCandidate> for IceCandidateInfo {
    fn from(c: &IceCandidate) -> Self {
        Self {
            candidate: c.candidate.clone(),
            sdp_mid: c.sdp_mid.clone(),
            sdp_m_line_index: c.sdp_m_line_index,
        }
    }
}

impl From<IceCandidateInfo> for IceCandidate {
    fn from(c: IceCandidateInfo) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_m_line_index: c.sdp_m_line_index,
        }
    }
}

/// A track inside a remote stream
#[derive(Debug, Clone, uniffi::Record)]
pub struct RemoteTrack {
    pub track_id: String,
    pub is_video: bool,
    pub content_id: Option<String>,
}

/// A stream received over a direct link
#[derive(Debug, Clone, uniffi::Record)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl From<StreamHandle> for RemoteStream {
    fn from(s: StreamHandle) -> Self {
        Self {
            stream_id: s.stream_id,
            tracks: s
                .tracks
                .into_iter()
                .map(|t| RemoteTrack {
                    track_id: t.track_id,
                    is_video: t.kind == TrackKind::Video,
                    content_id: t.content_id,
                })
                .collect(),
        }
    }
}

impl From<RemoteStream> for StreamHandle {
    fn from(s: RemoteStream) -> Self {
        Self {
            stream_id: s.stream_id,
            tracks: s
                .tracks
                .into_iter()
                .map(|t| crate::peer::TrackHandle {
                    track_id: t.track_id,
                    kind: if t.is_video {
                        TrackKind::Video
                    } else {
                        TrackKind::Audio
                    },
                    content_id: t.content_id,
                })
                .collect(),
        }
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_joined(&self, room_code: String, user_id: String, is_host: bool);
    fn on_playback_changed(&self, playback: PlaybackState);
    /// Drive the local player. Sent on every playback change, including the
    /// host's own actions.
    fn on_player_action(&self, action: PlayerAction);
    fn on_participants_changed(&self, participants: Vec<Participant>);
    fn on_host_changed(&self, host_id: String, is_local: bool);
    fn on_peer_connected(&self, remote_id: String);
    fn on_remote_stream(&self, remote_id: String, stream: RemoteStream);
    fn on_transfer_complete(&self, media_item_id: String, source_id: String, payload: Vec<u8>);
    fn on_transfer_abandoned(
        &self,
        media_item_id: String,
        source_id: String,
        received: u32,
        total: u32,
    );
    fn on_chat(&self, from: String, text: String, sent_at: f64);
    fn on_voice_changed(&self, user_id: String, in_voice: bool, state: VoiceState);
    /// Caught up with the host after a (re)sync
    fn on_synchronized(&self);
    fn on_error(&self, message: String);
    fn on_disconnected(&self);
}

/// The platform's WebRTC stack. Calls only start work; results are reported
/// back through the `report_*` methods on `Session`.
#[uniffi::export(callback_interface)]
pub trait PeerMediaCallback: Send + Sync {
    fn create_link(&self, remote_id: String) -> Result<(), CoreError>;
    fn create_offer(&self, remote_id: String) -> Result<(), CoreError>;
    fn accept_offer(&self, remote_id: String, sdp: String) -> Result<(), CoreError>;
    fn accept_answer(&self, remote_id: String, sdp: String) -> Result<(), CoreError>;
    fn add_remote_candidate(
        &self,
        remote_id: String,
        candidate: IceCandidateInfo,
    ) -> Result<(), CoreError>;
    /// `None` detaches the outbound video
    fn attach_video_track(
        &self,
        remote_id: String,
        track_id: Option<String>,
    ) -> Result<(), CoreError>;
    fn close(&self, remote_id: String);
}
