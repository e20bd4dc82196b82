//! Session implementation for FFI

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::directory::RoomId;
use crate::events::EventBus;
use crate::peer::{MediaBackend, NoopBackend, PeerEvent, SdpKind, TrackHandle};
use crate::relay::connect;
use crate::session::{JoinRequest, RoomSession};

use super::handlers::{forward_events, CallbackBackend, SharedCallback, SharedRoom};
use super::types::*;

static TRACING_INIT: Once = Once::new();

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    config: RwLock<SessionConfig>,
    callback: SharedCallback,
    media: RwLock<Option<Arc<dyn PeerMediaCallback>>>,
    room: SharedRoom,
    /// Bumped on every join so a stale disconnect cannot clear a newer room
    generation: AtomicU64,
}

#[uniffi::export]
impl Session {
    /// Create a new session
    #[uniffi::constructor]
    pub fn new() -> Result<Self, CoreError> {
        TRACING_INIT.call_once(|| {
            let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "cowatch_core=debug,tungstenite=info,hyper_util=off,hyper=off,reqwest=off",
                )
            });
            let _ = tracing_subscriber::fmt()
                .with_ansi(false) // Disable colors for Xcode console
                .with_target(false)
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        });

        info!("Initializing cowatch-core session");

        let runtime = Runtime::new()
            .map_err(|e| CoreError::NetworkError(format!("failed to start runtime: {}", e)))?;

        Ok(Self {
            runtime,
            config: RwLock::new(SessionConfig::default()),
            callback: Arc::new(RwLock::new(None)),
            media: RwLock::new(None),
            room: Arc::new(RwLock::new(None)),
            generation: AtomicU64::new(0),
        })
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Plug in the platform media stack. Without one, direct links are
    /// unavailable but playback sync and file sharing still work.
    /// Takes effect on the next join.
    pub fn set_media_backend(&self, media: Box<dyn PeerMediaCallback>) {
        *self.media.write() = Some(Arc::from(media));
    }

    /// Drift (seconds) beyond which a follower asks the host for a resync
    pub fn set_drift_threshold(&self, seconds: f64) -> Result<(), CoreError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(CoreError::InvalidArgument(format!(
                "drift threshold must be positive, got {}",
                seconds
            )));
        }
        self.config.write().drift_threshold_secs = seconds;
        Ok(())
    }

    pub fn set_join_timeout(&self, seconds: u32) {
        self.config.write().join_timeout = Duration::from_secs(u64::from(seconds.max(1)));
    }

    /// Create a new room (become host). Returns the room code.
    pub fn create_room(
        &self,
        relay_url: String,
        token: String,
        display_name: String,
    ) -> Result<String, CoreError> {
        let room_id = RoomId::random();
        self.join(relay_url, room_id.as_str().to_string(), token, display_name)?;
        info!("Created room: {}", room_id);
        Ok(room_id.to_string())
    }

    /// Join an existing room
    pub fn join_room(
        &self,
        relay_url: String,
        room_code: String,
        token: String,
        display_name: String,
    ) -> Result<(), CoreError> {
        let room_id = RoomId::parse(&room_code)
            .map_err(|_| CoreError::InvalidRoomCode(room_code.clone()))?;
        self.join(relay_url, room_id.as_str().to_string(), token, display_name)?;
        info!("Joined room: {}", room_id);
        Ok(())
    }

    /// Leave the current room
    pub fn leave_room(&self) -> Result<(), CoreError> {
        let (_, session) = self.room.write().take().ok_or(CoreError::NotInRoom)?;
        self.runtime.block_on(session.leave())?;
        info!("Left room");
        Ok(())
    }

    // ========================================================================
    // Host playback control
    // ========================================================================

    pub fn select_media(&self, media: MediaInfo) -> Result<(), CoreError> {
        let session = self.current()?;
        Ok(self.runtime.block_on(session.select_media(media.into()))?)
    }

    /// Play from `at_position` seconds, or from the current position
    pub fn play(&self, at_position: Option<f64>) -> Result<(), CoreError> {
        let session = self.current()?;
        Ok(self.runtime.block_on(session.play(at_position))?)
    }

    pub fn pause(&self) -> Result<(), CoreError> {
        let session = self.current()?;
        Ok(self.runtime.block_on(session.pause())?)
    }

    pub fn seek(&self, position_seconds: f64) -> Result<(), CoreError> {
        let session = self.current()?;
        Ok(self.runtime.block_on(session.seek(position_seconds))?)
    }

    /// Hand the host role to another participant
    pub fn transfer_host(&self, user_id: String) -> Result<(), CoreError> {
        let session = self.current()?;
        Ok(self.runtime.block_on(session.transfer_host(user_id))?)
    }

    // ========================================================================
    // Local player feedback
    // ========================================================================

    /// The local player finished loading the selected media
    pub fn media_ready(&self) -> Result<(), CoreError> {
        Ok(self.current()?.media_ready()?)
    }

    /// Where the local player actually is, in seconds
    pub fn report_position(&self, position_seconds: f64) -> Result<(), CoreError> {
        Ok(self.current()?.report_position(position_seconds)?)
    }

    pub fn request_resync(&self) -> Result<(), CoreError> {
        Ok(self.current()?.request_resync()?)
    }

    // ========================================================================
    // Media transport
    // ========================================================================

    /// Send a file to the room through the relay (host only). Returns the
    /// media item id receivers will see.
    pub fn share_file(
        &self,
        payload: Vec<u8>,
        media_item_id: Option<String>,
    ) -> Result<String, CoreError> {
        let session = self.current()?;
        Ok(self
            .runtime
            .block_on(session.share_file(media_item_id, payload, None))?)
    }

    /// Like `share_file`, reading the payload from disk
    pub fn share_file_from_path(
        &self,
        path: String,
        media_item_id: Option<String>,
    ) -> Result<String, CoreError> {
        let session = self.current()?;
        self.runtime.block_on(async {
            let payload = tokio::fs::read(&path)
                .await
                .map_err(|e| CoreError::InvalidArgument(format!("{}: {}", path, e)))?;
            debug!("Sharing {} ({} bytes)", path, payload.len());
            Ok(session.share_file(media_item_id, payload, None).await?)
        })
    }

    pub fn cancel_transfer(&self, media_item_id: String) -> Result<(), CoreError> {
        Ok(self.current()?.cancel_transfer(media_item_id)?)
    }

    /// Swap the video sent over direct links (screen share). `None` stops
    /// sending. Returns the number of links updated.
    pub fn replace_video_track(
        &self,
        track_id: Option<String>,
        content_id: Option<String>,
    ) -> Result<u32, CoreError> {
        let session = self.current()?;
        let track = track_id.map(|id| TrackHandle::video(id, content_id));
        let updated = self.runtime.block_on(session.replace_video_track(track))?;
        Ok(u32::try_from(updated).unwrap_or(u32::MAX))
    }

    // ========================================================================
    // Results from the platform media stack
    // ========================================================================

    pub fn report_local_description(
        &self,
        remote_id: String,
        is_offer: bool,
        sdp: String,
    ) -> Result<(), CoreError> {
        let kind = if is_offer { SdpKind::Offer } else { SdpKind::Answer };
        self.peer_event(PeerEvent::LocalDescription {
            remote_id,
            kind,
            sdp,
        })
    }

    pub fn report_local_candidate(
        &self,
        remote_id: String,
        candidate: IceCandidateInfo,
    ) -> Result<(), CoreError> {
        self.peer_event(PeerEvent::LocalCandidate {
            remote_id,
            candidate: candidate.into(),
        })
    }

    pub fn report_peer_connected(&self, remote_id: String) -> Result<(), CoreError> {
        self.peer_event(PeerEvent::Connected { remote_id })
    }

    pub fn report_peer_failed(&self, remote_id: String, reason: String) -> Result<(), CoreError> {
        self.peer_event(PeerEvent::Failed { remote_id, reason })
    }

    pub fn report_remote_stream(
        &self,
        remote_id: String,
        stream: RemoteStream,
    ) -> Result<(), CoreError> {
        self.peer_event(PeerEvent::RemoteTrack {
            remote_id,
            stream: stream.into(),
        })
    }

    pub fn report_peer_closed(&self, remote_id: String) -> Result<(), CoreError> {
        self.peer_event(PeerEvent::Closed { remote_id })
    }

    // ========================================================================
    // Chat and voice
    // ========================================================================

    pub fn send_chat(&self, text: String) -> Result<(), CoreError> {
        Ok(self.current()?.send_chat(text)?)
    }

    pub fn join_voice(&self) -> Result<(), CoreError> {
        Ok(self.current()?.join_voice()?)
    }

    pub fn leave_voice(&self) -> Result<(), CoreError> {
        Ok(self.current()?.leave_voice()?)
    }

    pub fn set_voice_state(&self, state: VoiceState) -> Result<(), CoreError> {
        Ok(self.current()?.set_voice_state(state.into())?)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current playback state, extrapolated to now
    pub fn get_playback_state(&self) -> Option<PlaybackState> {
        let session = self.current().ok()?;
        self.runtime
            .block_on(session.playback_state())
            .ok()
            .map(PlaybackState::from)
    }

    pub fn get_participants(&self) -> Vec<Participant> {
        let Ok(session) = self.current() else {
            return Vec::new();
        };
        self.runtime
            .block_on(session.participants())
            .map(|roster| roster.iter().map(Participant::from).collect())
            .unwrap_or_default()
    }

    /// Check if we are the host
    pub fn is_host(&self) -> bool {
        let Ok(session) = self.current() else {
            return false;
        };
        self.runtime.block_on(session.is_host()).unwrap_or(false)
    }

    /// Check if we are in a room
    pub fn is_in_room(&self) -> bool {
        self.room.read().is_some()
    }

    pub fn room_code(&self) -> Option<String> {
        self.room
            .read()
            .as_ref()
            .map(|(_, s)| s.room_id().to_string())
    }

    pub fn local_user_id(&self) -> Option<String> {
        self.room
            .read()
            .as_ref()
            .map(|(_, s)| s.local_id().to_string())
    }
}

impl Session {
    /// Connect to the relay and join `room_id`
    fn join(
        &self,
        relay_url: String,
        room_id: String,
        token: String,
        display_name: String,
    ) -> Result<(), CoreError> {
        if self.room.read().is_some() {
            return Err(CoreError::AlreadyInRoom);
        }

        let config = self.config.read().clone();
        let backend: Arc<dyn MediaBackend> = match self.media.read().clone() {
            Some(media) => Arc::new(CallbackBackend::new(media)),
            None => Arc::new(NoopBackend),
        };

        // Subscribe before joining so the first events reach the callback
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = EventBus::new();
        self.runtime.spawn(forward_events(
            events.subscribe(),
            Arc::clone(&self.callback),
            Arc::clone(&self.room),
            generation,
        ));

        let request = JoinRequest::new(room_id.clone(), token, display_name);
        let session = self.runtime.block_on(async {
            let link = connect(&relay_url, config.bulk_queue_depth)
                .await
                .map_err(|e| CoreError::NetworkError(e.to_string()))?;
            RoomSession::join_with(config, link, request, backend, events)
                .await
                .map_err(CoreError::from)
        });

        let session = match session {
            Ok(session) => session,
            Err(e) => {
                warn!("Joining {} failed: {}", room_id, e);
                return Err(e);
            }
        };

        let mut room = self.room.write();
        if room.is_some() {
            // Lost a race with another join
            drop(room);
            let _ = self.runtime.block_on(session.leave());
            return Err(CoreError::AlreadyInRoom);
        }
        *room = Some((generation, session));
        Ok(())
    }

    fn current(&self) -> Result<RoomSession, CoreError> {
        self.room
            .read()
            .as_ref()
            .map(|(_, s)| s.clone())
            .ok_or(CoreError::NotInRoom)
    }

    fn peer_event(&self, event: PeerEvent) -> Result<(), CoreError> {
        Ok(self.current()?.peer_event(event)?)
    }
}
