//! Room session handle
//!
//! `RoomSession` is a cheap, cloneable handle to the session actor. Methods
//! that need an answer wait for the actor; the rest are fire-and-forget.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::info;

use super::actor::{Actor, Command};
use crate::config::SessionConfig;
use crate::directory::Participant;
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent, Subscription};
use crate::peer::{MediaBackend, PeerEvent, TrackHandle};
use crate::relay::{ClientFrame, Lane, RelayLink, ServerFrame};
use crate::signaling::VoiceStatePayload;
use crate::sync::{MediaDescriptor, PlaybackState};

/// Who wants in, and where
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: String,
    pub token: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl JoinRequest {
    pub fn new(
        room_id: impl Into<String>,
        token: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            token: token.into(),
            display_name: display_name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// What the relay told us on admission
pub(crate) struct Admission {
    pub room_id: String,
    pub user_id: String,
    pub roster: Vec<Participant>,
    pub host_id: String,
    pub playback: PlaybackState,
}

#[derive(Clone)]
pub struct RoomSession {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus<SessionEvent>,
    room_id: String,
    local_id: String,
}

impl RoomSession {
    /// Join a room through `link` and start the session
    pub async fn join(
        config: SessionConfig,
        link: RelayLink,
        request: JoinRequest,
        backend: Arc<dyn MediaBackend>,
    ) -> Result<Self, SessionError> {
        Self::join_with(config, link, request, backend, EventBus::new()).await
    }

    /// Like [`RoomSession::join`], publishing on an existing bus so that
    /// subscribers see the session's first events
    pub async fn join_with(
        config: SessionConfig,
        link: RelayLink,
        request: JoinRequest,
        backend: Arc<dyn MediaBackend>,
        events: EventBus<SessionEvent>,
    ) -> Result<Self, SessionError> {
        let (relay, mut inbound) = link.split();
        let room_id = request.room_id.clone();

        relay
            .send(
                ClientFrame::Join {
                    room_id: request.room_id,
                    token: request.token,
                    display_name: request.display_name,
                    avatar: request.avatar,
                },
                Lane::Control,
            )
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let admitted = tokio::time::timeout(config.join_timeout, async {
            loop {
                match inbound.recv().await {
                    Some(ServerFrame::Joined {
                        room_id,
                        user_id,
                        roster,
                        host_id,
                        playback,
                    }) => {
                        return Ok(Admission {
                            room_id,
                            user_id,
                            roster,
                            host_id,
                            playback,
                        })
                    }
                    Some(ServerFrame::Error { kind, message }) => {
                        return Err(SessionError::from_relay(kind, message))
                    }
                    Some(_) => continue,
                    None => return Err(SessionError::Transport("relay closed".into())),
                }
            }
        })
        .await
        .map_err(|_| SessionError::RoomNotFound(room_id.clone()))??;

        info!(
            "Joined room {} as {} (host: {})",
            admitted.room_id, admitted.user_id, admitted.host_id
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let session = Self {
            commands,
            events: events.clone(),
            room_id: admitted.room_id.clone(),
            local_id: admitted.user_id.clone(),
        };
        let actor = Actor::new(config, relay, events, backend, admitted);
        tokio::spawn(actor.run(command_rx, inbound));
        Ok(session)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.events.subscribe()
    }

    fn tell(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::NotInRoom)
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tell(make(reply))?;
        rx.await.map_err(|_| SessionError::NotInRoom)
    }

    // ========================================================================
    // Host playback control
    // ========================================================================

    pub async fn select_media(&self, descriptor: MediaDescriptor) -> Result<(), SessionError> {
        self.ask(|reply| Command::SelectMedia { descriptor, reply })
            .await?
    }

    /// Play from `at_position`, or from the current position
    pub async fn play(&self, at_position: Option<f64>) -> Result<(), SessionError> {
        self.ask(|reply| Command::Play { at_position, reply }).await?
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.ask(|reply| Command::Pause { reply }).await?
    }

    pub async fn seek(&self, to_position: f64) -> Result<(), SessionError> {
        self.ask(|reply| Command::Seek { to_position, reply }).await?
    }

    pub async fn transfer_host(&self, user_id: impl Into<String>) -> Result<(), SessionError> {
        let user_id = user_id.into();
        self.ask(|reply| Command::TransferHost { user_id, reply })
            .await?
    }

    // ========================================================================
    // Local player feedback
    // ========================================================================

    /// The local player finished loading the selected media
    pub fn media_ready(&self) -> Result<(), SessionError> {
        self.tell(Command::MediaReady)
    }

    /// Where the local player actually is; large drift triggers a resync
    pub fn report_position(&self, position_seconds: f64) -> Result<(), SessionError> {
        self.tell(Command::ReportPosition(position_seconds))
    }

    pub fn request_resync(&self) -> Result<(), SessionError> {
        self.tell(Command::RequestResync)
    }

    // ========================================================================
    // Media transport
    // ========================================================================

    /// Stream `payload` to the room through the relay. Returns the media
    /// item id the receivers will see.
    pub async fn share_file(
        &self,
        media_item_id: Option<String>,
        payload: Vec<u8>,
        to: Option<String>,
    ) -> Result<String, SessionError> {
        self.ask(|reply| Command::ShareFile {
            media_item_id,
            payload,
            to,
            reply,
        })
        .await?
    }

    pub fn cancel_transfer(&self, media_item_id: impl Into<String>) -> Result<(), SessionError> {
        self.tell(Command::CancelTransfer {
            media_item_id: media_item_id.into(),
        })
    }

    /// Swap the outbound video on every direct link. Returns the number of
    /// links updated.
    pub async fn replace_video_track(
        &self,
        track: Option<TrackHandle>,
    ) -> Result<usize, SessionError> {
        self.ask(|reply| Command::ReplaceVideoTrack { track, reply })
            .await?
    }

    /// Feed a result from the platform media stack
    pub fn peer_event(&self, event: PeerEvent) -> Result<(), SessionError> {
        self.tell(Command::Peer(event))
    }

    // ========================================================================
    // Chat and voice
    // ========================================================================

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.tell(Command::SendChat { text: text.into() })
    }

    pub fn join_voice(&self) -> Result<(), SessionError> {
        self.tell(Command::JoinVoice)
    }

    pub fn leave_voice(&self) -> Result<(), SessionError> {
        self.tell(Command::LeaveVoice)
    }

    pub fn set_voice_state(&self, state: VoiceStatePayload) -> Result<(), SessionError> {
        self.tell(Command::SetVoiceState(state))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current playback state, extrapolated to now
    pub async fn playback_state(&self) -> Result<PlaybackState, SessionError> {
        self.ask(|reply| Command::PlaybackState { reply }).await
    }

    pub async fn participants(&self) -> Result<Vec<Participant>, SessionError> {
        self.ask(|reply| Command::Participants { reply }).await
    }

    pub async fn is_host(&self) -> Result<bool, SessionError> {
        self.ask(|reply| Command::IsHost { reply }).await
    }

    /// Leave the room. Cancels transfers, negotiations and resyncs.
    pub async fn leave(&self) -> Result<(), SessionError> {
        self.ask(|reply| Command::Leave { reply }).await
    }
}
