//! Bridges between the session and the native callbacks

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::types::*;
use crate::events::{SessionEvent, Subscription};
use crate::peer::{BackendError, MediaBackend, TrackHandle};
use crate::session::RoomSession;
use crate::signaling::IceCandidate;

pub(super) type SharedCallback = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

/// The joined room, tagged with the join that produced it
pub(super) type SharedRoom = Arc<RwLock<Option<(u64, RoomSession)>>>;

/// Exposes the native media stack as a [`MediaBackend`]
pub(super) struct CallbackBackend {
    media: Arc<dyn PeerMediaCallback>,
}

impl CallbackBackend {
    pub(super) fn new(media: Arc<dyn PeerMediaCallback>) -> Self {
        Self { media }
    }
}

fn failed(e: CoreError) -> BackendError {
    BackendError::Failed(e.to_string())
}

impl MediaBackend for CallbackBackend {
    fn create_link(&self, remote_id: &str) -> Result<(), BackendError> {
        self.media.create_link(remote_id.to_string()).map_err(failed)
    }

    fn create_offer(&self, remote_id: &str) -> Result<(), BackendError> {
        self.media.create_offer(remote_id.to_string()).map_err(failed)
    }

    fn accept_offer(&self, remote_id: &str, sdp: &str) -> Result<(), BackendError> {
        self.media
            .accept_offer(remote_id.to_string(), sdp.to_string())
            .map_err(failed)
    }

    fn accept_answer(&self, remote_id: &str, sdp: &str) -> Result<(), BackendError> {
        self.media
            .accept_answer(remote_id.to_string(), sdp.to_string())
            .map_err(failed)
    }

    fn add_remote_candidate(
        &self,
        remote_id: &str,
        candidate: &IceCandidate,
    ) -> Result<(), BackendError> {
        self.media
            .add_remote_candidate(remote_id.to_string(), IceCandidateInfo::from(candidate))
            .map_err(failed)
    }

    fn attach_video_track(
        &self,
        remote_id: &str,
        track: Option<&TrackHandle>,
    ) -> Result<(), BackendError> {
        self.media
            .attach_video_track(remote_id.to_string(), track.map(|t| t.track_id.clone()))
            .map_err(failed)
    }

    fn close(&self, remote_id: &str) {
        self.media.close(remote_id.to_string());
    }
}

/// Forward session events to the native callback until the session ends
pub(super) async fn forward_events(
    mut events: Subscription<SessionEvent>,
    callback: SharedCallback,
    room: SharedRoom,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        let ended = event == SessionEvent::Disconnected;
        if ended {
            let mut room = room.write();
            if room.as_ref().is_some_and(|(g, _)| *g == generation) {
                *room = None;
            }
        }

        // Clone out so the lock is not held across the callback
        let cb = callback.read().clone();
        match cb {
            Some(cb) => handle_session_event(event, cb.as_ref()),
            None => debug!("No callback set, dropping session event"),
        }

        if ended {
            break;
        }
    }
}

fn handle_session_event(event: SessionEvent, cb: &dyn SessionCallback) {
    match event {
        SessionEvent::Joined {
            room_id,
            user_id,
            is_host,
        } => cb.on_joined(room_id, user_id, is_host),
        SessionEvent::PlaybackStateChanged(state) => cb.on_playback_changed(state.into()),
        SessionEvent::Player(command) => cb.on_player_action(command.into()),
        SessionEvent::ParticipantsChanged(roster) => {
            cb.on_participants_changed(roster.iter().map(Participant::from).collect())
        }
        SessionEvent::HostChanged { host_id, is_local } => cb.on_host_changed(host_id, is_local),
        SessionEvent::PeerConnected { remote_id } => cb.on_peer_connected(remote_id),
        SessionEvent::PeerStreamReceived { remote_id, stream } => {
            cb.on_remote_stream(remote_id, stream.into())
        }
        SessionEvent::TransferComplete {
            media_item_id,
            source_id,
            payload,
        } => {
            let payload = Arc::try_unwrap(payload).unwrap_or_else(|shared| (*shared).clone());
            cb.on_transfer_complete(media_item_id, source_id, payload);
        }
        SessionEvent::TransferAbandoned {
            media_item_id,
            source_id,
            received,
            total,
        } => cb.on_transfer_abandoned(media_item_id, source_id, received, total),
        SessionEvent::Chat {
            from,
            text,
            sent_at,
        } => cb.on_chat(from, text, sent_at),
        SessionEvent::VoiceChanged {
            user_id,
            in_voice,
            state,
        } => cb.on_voice_changed(user_id, in_voice, state.into()),
        SessionEvent::Synchronized => cb.on_synchronized(),
        SessionEvent::Error(e) => {
            warn!("Session error: {}", e);
            cb.on_error(e.to_string());
        }
        SessionEvent::Disconnected => cb.on_disconnected(),
    }
}
