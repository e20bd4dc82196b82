//! Session actor
//!
//! One task per joined room. It owns the sync engine, the peer manager and
//! the reassembler, and is the only thing that talks to the relay after
//! admission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::handle::Admission;
use crate::config::SessionConfig;
use crate::directory::Participant;
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};
use crate::peer::{MediaBackend, PeerError, PeerEvent, PeerManager, PeerOutput, TrackHandle};
use crate::relay::{ClientFrame, Lane, RelaySender, ServerFrame};
use crate::signaling::{
    decode, encode, ChatPayload, ChunkPayload, Envelope, SignalMessage, VoiceStatePayload,
};
use crate::sync::{Ignored, MediaDescriptor, PlaybackState, SyncEngine, SyncError};
use crate::transfer::{
    begin_send, new_media_item_id, ChunkOutcome, OutboundTransfer, Reassembler, SendPlan,
    TransferError,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests from [`RoomSession`](super::RoomSession) handles
pub(crate) enum Command {
    // === Host playback control ===
    SelectMedia {
        descriptor: MediaDescriptor,
        reply: Reply<()>,
    },
    Play {
        at_position: Option<f64>,
        reply: Reply<()>,
    },
    Pause {
        reply: Reply<()>,
    },
    Seek {
        to_position: f64,
        reply: Reply<()>,
    },
    TransferHost {
        user_id: String,
        reply: Reply<()>,
    },

    // === Local player feedback ===
    MediaReady,
    ReportPosition(f64),
    RequestResync,

    // === Media transport ===
    ShareFile {
        media_item_id: Option<String>,
        payload: Vec<u8>,
        to: Option<String>,
        reply: Reply<String>,
    },
    CancelTransfer {
        media_item_id: String,
    },
    ReplaceVideoTrack {
        track: Option<TrackHandle>,
        reply: Reply<usize>,
    },
    Peer(PeerEvent),

    // === Chat and voice ===
    SendChat {
        text: String,
    },
    JoinVoice,
    LeaveVoice,
    SetVoiceState(VoiceStatePayload),

    // === Queries ===
    PlaybackState {
        reply: oneshot::Sender<PlaybackState>,
    },
    Participants {
        reply: oneshot::Sender<Vec<Participant>>,
    },
    IsHost {
        reply: oneshot::Sender<bool>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// An outstanding snapshot request
struct Resync {
    attempt: u32,
    deadline: Instant,
}

pub(crate) struct Actor {
    config: SessionConfig,
    room_id: String,
    local_id: String,
    relay: RelaySender,
    events: EventBus<SessionEvent>,
    sync: SyncEngine,
    peers: PeerManager,
    reassembler: Reassembler,
    roster: Vec<Participant>,
    /// Last playback state the relay has on record for the room
    directory_snapshot: PlaybackState,
    outbound: HashMap<String, OutboundTransfer>,
    resync: Option<Resync>,
    /// Remote participants in voice
    voice: HashMap<String, VoiceStatePayload>,
    in_voice: bool,
}

impl Actor {
    pub(crate) fn new(
        config: SessionConfig,
        relay: RelaySender,
        events: EventBus<SessionEvent>,
        backend: Arc<dyn MediaBackend>,
        admitted: Admission,
    ) -> Self {
        let is_host = admitted.host_id == admitted.user_id;
        let sync = SyncEngine::new(
            admitted.user_id.clone(),
            admitted.host_id.clone(),
            PlaybackState::default(),
            config.drift_threshold_secs,
        );
        let peers =
            PeerManager::new(backend, is_host).with_failure_window(config.peer_failure_window);
        let reassembler =
            Reassembler::new(config.max_transfer_bytes, config.transfer_idle_timeout);

        Self {
            config,
            room_id: admitted.room_id,
            local_id: admitted.user_id,
            relay,
            events,
            sync,
            peers,
            reassembler,
            roster: admitted.roster,
            directory_snapshot: admitted.playback,
            outbound: HashMap::new(),
            resync: None,
            voice: HashMap::new(),
            in_voice: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        self.start();

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let resync_deadline = self.resync.as_ref().map(|r| r.deadline);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave { reply }) => {
                        self.shutdown(true);
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All session handles dropped, leaving {}", self.room_id);
                        self.shutdown(true);
                        break;
                    }
                },
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => {
                        warn!("Lost the relay connection for room {}", self.room_id);
                        self.shutdown(false);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(resync_deadline.unwrap_or_else(Instant::now)),
                    if resync_deadline.is_some() => self.resync_due(),
                _ = sweep.tick() => self.sweep(),
            }
        }

        info!("Session for room {} ended", self.room_id);
        self.events.emit(SessionEvent::Disconnected);
    }

    fn start(&mut self) {
        self.events.emit(SessionEvent::Joined {
            room_id: self.room_id.clone(),
            user_id: self.local_id.clone(),
            is_host: self.sync.is_host(),
        });
        self.events
            .emit(SessionEvent::ParticipantsChanged(self.roster.clone()));
        self.peers.update_roster(self.remote_ids());

        if self.sync.is_host() {
            // Rejoining hosts pick up where the directory left off
            self.become_host();
        } else {
            self.start_resync();
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        let now = self.config.clock.now();
        match command {
            Command::SelectMedia { descriptor, reply } => {
                let result = self.sync.select_media(descriptor, now);
                let _ = reply.send(self.host_result(result));
            }
            Command::Play { at_position, reply } => {
                let result = self.sync.play(at_position, now);
                let _ = reply.send(self.host_result(result));
            }
            Command::Pause { reply } => {
                let result = self.sync.pause(now);
                let _ = reply.send(self.host_result(result));
            }
            Command::Seek { to_position, reply } => {
                let result = self.sync.seek(to_position, now);
                let _ = reply.send(self.host_result(result));
            }
            Command::TransferHost { user_id, reply } => {
                let _ = reply.send(self.transfer_host(user_id));
            }

            Command::MediaReady => {
                if self.sync.media_ready() {
                    debug!("Local player ready");
                }
            }
            Command::ReportPosition(position) => {
                if let Some(deviation) = self.sync.check_drift(position, now) {
                    info!("Drifted {:.2}s from host, resyncing", deviation);
                    if self.resync.is_none() {
                        self.start_resync();
                    }
                }
            }
            Command::RequestResync => {
                if !self.sync.is_host() {
                    self.start_resync();
                }
            }

            Command::ShareFile {
                media_item_id,
                payload,
                to,
                reply,
            } => {
                let _ = reply.send(self.share_file(media_item_id, payload, to));
            }
            Command::CancelTransfer { media_item_id } => {
                if let Some(mut transfer) = self.outbound.remove(&media_item_id) {
                    transfer.cancel();
                }
            }
            Command::ReplaceVideoTrack { track, reply } => {
                let result = self
                    .peers
                    .replace_outbound_video_track(track)
                    .map_err(SessionError::from);
                let _ = reply.send(result);
                self.reconcile_links();
            }
            Command::Peer(event) => {
                let outputs = self.peers.handle_event(event, Instant::now());
                self.handle_peer_outputs(outputs);
            }

            Command::SendChat { text } => {
                self.broadcast(SignalMessage::Chat(ChatPayload { text, sent_at: now }));
            }
            Command::JoinVoice => {
                if !self.in_voice {
                    self.in_voice = true;
                    self.broadcast(SignalMessage::VoiceJoin);
                    self.reconcile_links();
                }
            }
            Command::LeaveVoice => {
                if self.in_voice {
                    self.in_voice = false;
                    self.broadcast(SignalMessage::VoiceLeave);
                }
            }
            Command::SetVoiceState(state) => {
                self.broadcast(SignalMessage::VoiceState(state));
            }

            Command::PlaybackState { reply } => {
                let _ = reply.send(self.sync.snapshot(now));
            }
            Command::Participants { reply } => {
                let _ = reply.send(self.roster.clone());
            }
            Command::IsHost { reply } => {
                let _ = reply.send(self.sync.is_host());
            }
            Command::Leave { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    /// Broadcast a host action that went through
    fn host_result(
        &mut self,
        result: Result<SignalMessage, SyncError>,
    ) -> Result<(), SessionError> {
        let message = result?;
        // The host's player follows the same commands as everyone else's
        let now = self.config.clock.now();
        for command in self.sync.local_commands(&message, now) {
            self.events.emit(SessionEvent::Player(command));
        }
        self.announce(message);
        Ok(())
    }

    /// Send a playback change to the room and the directory
    fn announce(&mut self, message: SignalMessage) {
        let now = self.config.clock.now();
        self.broadcast(message);
        self.publish_state();
        self.events
            .emit(SessionEvent::PlaybackStateChanged(self.sync.snapshot(now)));
    }

    fn transfer_host(&mut self, user_id: String) -> Result<(), SessionError> {
        if !self.sync.is_host() {
            return Err(SessionError::NotHost);
        }
        if !self.roster.iter().any(|p| p.user_id == user_id) {
            return Err(SessionError::UnknownParticipant(user_id));
        }
        // Our role changes when the relay's roster says so
        self.publish_state();
        self.relay
            .send(ClientFrame::TransferHost { user_id }, Lane::Control)
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    fn share_file(
        &mut self,
        media_item_id: Option<String>,
        payload: Vec<u8>,
        to: Option<String>,
    ) -> Result<String, SessionError> {
        if !self.sync.is_host() {
            return Err(TransferError::NotHost.into());
        }
        let media_item_id = media_item_id.unwrap_or_else(new_media_item_id);
        if self.peers.has_flowing_media(&media_item_id) {
            return Err(TransferError::DirectMediaActive(media_item_id).into());
        }
        let plan = SendPlan {
            room_id: self.room_id.clone(),
            from: self.local_id.clone(),
            to,
            chunk_size: self.config.chunk_size,
            pace: self.config.chunk_pace,
        };
        let transfer = begin_send(self.relay.clone(), plan, media_item_id.clone(), payload);
        // Replacing an entry cancels the older transfer on drop
        self.outbound.insert(media_item_id.clone(), transfer);
        Ok(media_item_id)
    }

    fn handle_peer_outputs(&mut self, outputs: Vec<PeerOutput>) {
        for output in outputs {
            match output {
                PeerOutput::Signal { to, message } => self.send_to(&to, message),
                PeerOutput::Connected { remote_id } => {
                    self.events.emit(SessionEvent::PeerConnected { remote_id });
                }
                PeerOutput::StreamReceived { remote_id, stream } => {
                    self.events
                        .emit(SessionEvent::PeerStreamReceived { remote_id, stream });
                }
                PeerOutput::Unreachable { remote_id } => {
                    self.events
                        .emit(SessionEvent::Error(SessionError::PeerUnreachable(remote_id)));
                }
            }
        }
    }

    // ========================================================================
    // Relay frames
    // ========================================================================

    fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Signal { from, envelope } => match decode(&envelope) {
                Ok(envelope) => self.handle_envelope(from, envelope),
                Err(e) => debug!("Dropping undecodable envelope from {}: {}", from, e),
            },
            ServerFrame::Roster {
                roster,
                host_id,
                playback,
            } => self.on_roster(roster, host_id, playback),
            ServerFrame::Error { kind, message } => {
                warn!("Relay error ({:?}): {}", kind, message);
                self.events
                    .emit(SessionEvent::Error(SessionError::from_relay(kind, message)));
            }
            ServerFrame::Joined { .. } => debug!("Ignoring repeated joined frame"),
        }
    }

    /// `from` is stamped by the relay and wins over the envelope's own
    fn handle_envelope(&mut self, from: String, envelope: Envelope) {
        if envelope.room_id != self.room_id {
            debug!(
                "Dropping envelope for room {} in room {}",
                envelope.room_id, self.room_id
            );
            return;
        }

        let message = envelope.message;
        match &message {
            SignalMessage::Offer(_) | SignalMessage::Answer(_) | SignalMessage::IceCandidate(_) => {
                match self.peers.handle_signal(&from, &message) {
                    Ok(()) => {}
                    Err(e @ PeerError::StaleSignal { .. }) => debug!("{}", e),
                    Err(e) => {
                        warn!("Negotiation with {} failed: {}", from, e);
                        self.events.emit(SessionEvent::Error(e.into()));
                    }
                }
            }
            SignalMessage::Chunk(chunk) => self.on_chunk(&from, chunk),
            SignalMessage::StateSnapshotRequest => {
                if self.sync.is_host() {
                    let now = self.config.clock.now();
                    if let Ok(snapshot) = self.sync.snapshot_message(now) {
                        debug!("Answering snapshot request from {}", from);
                        self.send_to(&from, snapshot);
                    }
                }
            }
            SignalMessage::Chat(chat) => {
                self.events.emit(SessionEvent::Chat {
                    from,
                    text: chat.text.clone(),
                    sent_at: chat.sent_at,
                });
            }
            SignalMessage::VoiceJoin => {
                self.voice.insert(from.clone(), VoiceStatePayload::default());
                self.emit_voice(&from);
                self.reconcile_links();
            }
            SignalMessage::VoiceLeave => {
                self.voice.remove(&from);
                self.emit_voice(&from);
            }
            SignalMessage::VoiceState(state) => {
                if let Some(current) = self.voice.get_mut(&from) {
                    *current = *state;
                    self.emit_voice(&from);
                }
            }
            SignalMessage::Unknown { kind, .. } => {
                debug!("Ignoring unknown message type {} from {}", kind, from);
            }
            _ => self.apply_playback(&from, &message),
        }
    }

    fn apply_playback(&mut self, from: &str, message: &SignalMessage) {
        let now = self.config.clock.now();
        match self.sync.apply(from, message, now) {
            Ok(commands) => {
                for command in commands {
                    self.events.emit(SessionEvent::Player(command));
                }
                self.events
                    .emit(SessionEvent::PlaybackStateChanged(self.sync.snapshot(now)));
                if matches!(message, SignalMessage::StateSnapshot(_))
                    && self.resync.take().is_some()
                {
                    info!("Synchronized with host {}", from);
                    self.events.emit(SessionEvent::Synchronized);
                }
            }
            Err(Ignored::Stale { at, watermark }) => {
                debug!("Stale {} ({} < {})", message.kind(), at, watermark);
            }
            Err(reason) => debug!("Ignored {} from {}: {:?}", message.kind(), from, reason),
        }
    }

    fn on_chunk(&mut self, from: &str, chunk: &ChunkPayload) {
        match self.reassembler.on_chunk(from, chunk, Instant::now()) {
            Ok(ChunkOutcome::Complete(payload)) => {
                info!(
                    "Received {} from {} ({} bytes)",
                    chunk.media_item_id,
                    from,
                    payload.len()
                );
                self.events.emit(SessionEvent::TransferComplete {
                    media_item_id: chunk.media_item_id.clone(),
                    source_id: from.to_string(),
                    payload: Arc::new(payload),
                });
            }
            Ok(ChunkOutcome::Pending { .. }) | Ok(ChunkOutcome::Duplicate) => {}
            // The reassembler already dropped the session
            Err(TransferError::Abandoned {
                media_item_id,
                received,
                total,
            }) => {
                warn!(
                    "Abandoned {} from {} at {}/{} chunks",
                    media_item_id, from, received, total
                );
                self.events.emit(SessionEvent::TransferAbandoned {
                    media_item_id,
                    source_id: from.to_string(),
                    received,
                    total,
                });
            }
            Err(e) => warn!("Dropping chunk of {} from {}: {}", chunk.media_item_id, from, e),
        }
    }

    fn on_roster(&mut self, roster: Vec<Participant>, host_id: String, playback: PlaybackState) {
        self.directory_snapshot = playback;
        self.roster = roster;

        let departed = self.peers.update_roster(self.remote_ids());
        for id in &departed {
            self.reassembler.abort_source(id);
        }
        let roster = &self.roster;
        self.voice
            .retain(|id, _| roster.iter().any(|p| &p.user_id == id));
        self.events
            .emit(SessionEvent::ParticipantsChanged(self.roster.clone()));

        if self.sync.host_id() != host_id {
            info!("Host of {} is now {}", self.room_id, host_id);
            let is_local = host_id == self.local_id;
            // Links are always initiated by the current host
            self.peers.teardown_all();
            if is_local {
                self.become_host();
            } else {
                self.sync.set_host(&host_id);
                self.peers.set_initiator(false);
                self.start_resync();
            }
            self.events
                .emit(SessionEvent::HostChanged { host_id, is_local });
        }
        self.reconcile_links();
    }

    fn become_host(&mut self) {
        let now = self.config.clock.now();
        self.resync = None;
        self.peers.set_initiator(true);

        let seed = self.directory_snapshot.clone();
        let promotion = self.sync.promote(Some(&seed), now);
        for command in promotion.commands {
            self.events.emit(SessionEvent::Player(command));
        }
        if !self.sync.state().media_descriptor.is_none() {
            self.broadcast(promotion.announce);
            self.publish_state();
        }
        self.events
            .emit(SessionEvent::PlaybackStateChanged(self.sync.snapshot(now)));
    }

    // ========================================================================
    // Resync
    // ========================================================================

    fn start_resync(&mut self) {
        self.resync = Some(Resync {
            attempt: 0,
            deadline: Instant::now(),
        });
        self.resync_due();
    }

    fn resync_due(&mut self) {
        let attempts = self.config.snapshot_retry_attempts;
        let Some(resync) = self.resync.as_mut() else {
            return;
        };
        if resync.attempt >= attempts {
            warn!("No snapshot from host after {} attempts", attempts);
            self.resync = None;
            self.events
                .emit(SessionEvent::Error(SessionError::NotSynchronized { attempts }));
            return;
        }
        resync.attempt += 1;
        resync.deadline = Instant::now() + self.config.retry_delay(resync.attempt);
        debug!("Requesting snapshot (attempt {})", resync.attempt);
        self.broadcast(SignalMessage::StateSnapshotRequest);
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    fn sweep(&mut self) {
        for (key, error) in self.reassembler.sweep(Instant::now()) {
            if let TransferError::Abandoned {
                media_item_id,
                received,
                total,
            } = error
            {
                warn!(
                    "Abandoned {} from {} at {}/{} chunks",
                    media_item_id, key.source_id, received, total
                );
                self.events.emit(SessionEvent::TransferAbandoned {
                    media_item_id,
                    source_id: key.source_id,
                    received,
                    total,
                });
            }
        }
        self.outbound.retain(|_, t| !t.is_finished());
    }

    /// The host brings up direct links where media or voice needs them
    fn reconcile_links(&mut self) {
        if !self.sync.is_host() {
            return;
        }
        let sharing = self.peers.outbound_video().is_some();
        let wanted: Vec<String> = self
            .roster
            .iter()
            .filter(|p| p.user_id != self.local_id && p.is_connected())
            .filter(|p| sharing || (self.in_voice && self.voice.contains_key(&p.user_id)))
            .map(|p| p.user_id.clone())
            .collect();

        for remote_id in wanted {
            match self.peers.ensure_link_to(&remote_id) {
                Ok(_) | Err(PeerError::Unreachable(_)) => {}
                Err(e) => {
                    warn!("Could not link to {}: {}", remote_id, e);
                    self.events.emit(SessionEvent::Error(e.into()));
                }
            }
        }
    }

    fn shutdown(&mut self, send_leave: bool) {
        for (_, mut transfer) in self.outbound.drain() {
            transfer.cancel();
        }
        self.peers.teardown_all();
        self.reassembler.clear();
        self.resync = None;
        if send_leave {
            let _ = self.relay.send(ClientFrame::Leave, Lane::Control);
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn remote_ids(&self) -> Vec<String> {
        self.roster
            .iter()
            .filter(|p| p.user_id != self.local_id)
            .map(|p| p.user_id.clone())
            .collect()
    }

    fn emit_voice(&self, user_id: &str) {
        let state = self.voice.get(user_id).copied();
        self.events.emit(SessionEvent::VoiceChanged {
            user_id: user_id.to_string(),
            in_voice: state.is_some(),
            state: state.unwrap_or_default(),
        });
    }

    fn publish_state(&self) {
        if !self.sync.is_host() {
            return;
        }
        let playback = self.sync.snapshot(self.config.clock.now());
        if let Err(e) = self
            .relay
            .send(ClientFrame::PublishState { playback }, Lane::Control)
        {
            warn!("Could not publish state: {}", e);
        }
    }

    fn broadcast(&self, message: SignalMessage) {
        self.send_signal(None, message);
    }

    fn send_to(&self, to: &str, message: SignalMessage) {
        self.send_signal(Some(to.to_string()), message);
    }

    fn send_signal(&self, to: Option<String>, message: SignalMessage) {
        let lane = message.lane();
        let envelope = Envelope::new(
            self.room_id.clone(),
            self.local_id.clone(),
            to.clone(),
            message,
        );
        let text = match encode(&envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", envelope.message.kind(), e);
                return;
            }
        };
        if let Err(e) = self.relay.send(
            ClientFrame::Signal {
                to,
                lane,
                envelope: text,
            },
            lane,
        ) {
            warn!("Relay send failed: {}", e);
        }
    }
}
