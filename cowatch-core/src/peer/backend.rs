//! Media capability interface
//!
//! Platform media stacks (WebRTC on iOS/Android/desktop) implement
//! `MediaBackend`. Calls only start work; results come back later as
//! [`PeerEvent`]s.

use thiserror::Error;

use crate::signaling::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

/// A local or remote media track owned by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHandle {
    pub track_id: String,
    pub kind: TrackKind,
    /// Media item this track carries, if any
    pub content_id: Option<String>,
}

impl TrackHandle {
    pub fn video(track_id: impl Into<String>, content_id: Option<String>) -> Self {
        Self {
            track_id: track_id.into(),
            kind: TrackKind::Video,
            content_id,
        }
    }
}

/// A remote stream delivered over a direct link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub stream_id: String,
    pub tracks: Vec<TrackHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Asynchronous results from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalDescription {
        remote_id: String,
        kind: SdpKind,
        sdp: String,
    },
    LocalCandidate {
        remote_id: String,
        candidate: IceCandidate,
    },
    Connected {
        remote_id: String,
    },
    Failed {
        remote_id: String,
        reason: String,
    },
    RemoteTrack {
        remote_id: String,
        stream: StreamHandle,
    },
    Closed {
        remote_id: String,
    },
}

impl PeerEvent {
    pub fn remote_id(&self) -> &str {
        match self {
            PeerEvent::LocalDescription { remote_id, .. }
            | PeerEvent::LocalCandidate { remote_id, .. }
            | PeerEvent::Connected { remote_id }
            | PeerEvent::Failed { remote_id, .. }
            | PeerEvent::RemoteTrack { remote_id, .. }
            | PeerEvent::Closed { remote_id } => remote_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("not supported by this platform: {0}")]
    Unsupported(&'static str),
    #[error("media backend failed: {0}")]
    Failed(String),
}

pub trait MediaBackend: Send + Sync {
    fn create_link(&self, remote_id: &str) -> Result<(), BackendError>;

    /// The offer arrives as [`PeerEvent::LocalDescription`] with [`SdpKind::Offer`]
    fn create_offer(&self, remote_id: &str) -> Result<(), BackendError>;

    /// Sets the remote offer and starts producing an answer
    fn accept_offer(&self, remote_id: &str, sdp: &str) -> Result<(), BackendError>;

    fn accept_answer(&self, remote_id: &str, sdp: &str) -> Result<(), BackendError>;

    fn add_remote_candidate(
        &self,
        remote_id: &str,
        candidate: &IceCandidate,
    ) -> Result<(), BackendError>;

    /// Swap the outbound video source without renegotiating. `None` detaches.
    fn attach_video_track(
        &self,
        remote_id: &str,
        track: Option<&TrackHandle>,
    ) -> Result<(), BackendError>;

    fn close(&self, remote_id: &str);
}

/// Backend for builds without a media stack. Control and chunk transfer still
/// work; direct links do not.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

impl MediaBackend for NoopBackend {
    fn create_link(&self, _remote_id: &str) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("direct links"))
    }

    fn create_offer(&self, _remote_id: &str) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("offers"))
    }

    fn accept_offer(&self, _remote_id: &str, _sdp: &str) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("answers"))
    }

    fn accept_answer(&self, _remote_id: &str, _sdp: &str) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("answers"))
    }

    fn add_remote_candidate(
        &self,
        _remote_id: &str,
        _candidate: &IceCandidate,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("candidates"))
    }

    fn attach_video_track(
        &self,
        _remote_id: &str,
        _track: Option<&TrackHandle>,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("video tracks"))
    }

    fn close(&self, _remote_id: &str) {}
}
