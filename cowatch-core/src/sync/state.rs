//! Playback Synchronization State Machine
//!
//! The host owns canonical playback state and turns local actions into
//! signaling messages. Followers mirror the host and translate inbound
//! messages into commands for their local player.

use tracing::{debug, warn};

use super::protocol::{MediaDescriptor, PlaybackState};
use crate::signaling::{
    MediaSelectedPayload, PlayPayload, PositionPayload, SignalMessage, SnapshotPayload,
};

/// Where the local player is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No media selected
    Idle,
    /// Media selected, player has not reported ready yet
    MediaLoading,
    /// Player loaded, state is paused or playing
    Ready,
}

/// Instructions for the local player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Load(MediaDescriptor),
    Unload,
    SeekTo(f64),
    Play,
    Pause,
}

/// Local playback actions that could not be performed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("only the host can control playback")]
    NotHost,
    #[error("no media selected")]
    NoMedia,
    #[error("invalid position: {0}")]
    InvalidPosition(f64),
}

/// Why an inbound message was not applied
#[derive(Debug, Clone, PartialEq)]
pub enum Ignored {
    /// Sender is not the current host
    NotFromHost(String),
    /// Older than something already applied
    Stale { at: f64, watermark: f64 },
    /// We are the host; nobody else gets to drive us
    LocalIsHost,
    /// Not a playback message
    NotPlayback,
}

/// Result of taking over as host
#[derive(Debug, Clone)]
pub struct Promotion {
    /// Fresh snapshot to broadcast to the room
    pub announce: SignalMessage,
    /// Commands for the local player if the seeded state differs from ours
    pub commands: Vec<PlayerCommand>,
}

/// Host-authoritative playback state for one participant in one room
#[derive(Debug, Clone)]
pub struct SyncEngine {
    local_id: String,
    host_id: String,
    state: PlaybackState,
    phase: SyncPhase,
    /// Host timestamp of the newest applied message
    watermark: Option<f64>,
    drift_threshold: f64,
}

impl SyncEngine {
    pub fn new(
        local_id: impl Into<String>,
        host_id: impl Into<String>,
        initial: PlaybackState,
        drift_threshold: f64,
    ) -> Self {
        let phase = if initial.media_descriptor.is_none() {
            SyncPhase::Idle
        } else {
            SyncPhase::MediaLoading
        };
        Self {
            local_id: local_id.into(),
            host_id: host_id.into(),
            state: initial,
            phase,
            watermark: None,
            drift_threshold,
        }
    }

    pub fn is_host(&self) -> bool {
        self.local_id == self.host_id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Stored state, anchored at its `last_updated`
    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    /// State re-anchored at `now`
    pub fn snapshot(&self, now: f64) -> PlaybackState {
        self.state.extrapolated(now)
    }

    /// Record a host change. Returns true if the host actually changed.
    pub fn set_host(&mut self, host_id: &str) -> bool {
        if self.host_id == host_id {
            return false;
        }
        debug!("Host changed: {} -> {}", self.host_id, host_id);
        self.host_id = host_id.to_string();
        // Timestamps from a different host are not comparable
        self.watermark = None;
        true
    }

    // ========================================================================
    // Host actions
    // ========================================================================

    pub fn select_media(
        &mut self,
        descriptor: MediaDescriptor,
        now: f64,
    ) -> Result<SignalMessage, SyncError> {
        self.require_host()?;
        self.phase = if descriptor.is_none() {
            SyncPhase::Idle
        } else {
            SyncPhase::MediaLoading
        };
        self.state = PlaybackState {
            media_descriptor: descriptor.clone(),
            is_playing: false,
            position_seconds: 0.0,
            last_updated: now,
        };
        Ok(SignalMessage::MediaSelected(MediaSelectedPayload {
            descriptor,
            at_timestamp: Some(now),
        }))
    }

    /// Start playing, from `at_position` or from wherever we are
    pub fn play(&mut self, at_position: Option<f64>, now: f64) -> Result<SignalMessage, SyncError> {
        self.require_media()?;
        let position = match at_position {
            Some(p) => validate_position(p)?,
            None => self.state.position_at(now),
        };
        self.state.is_playing = true;
        self.state.position_seconds = position;
        self.state.last_updated = now;
        Ok(SignalMessage::PlaybackPlay(PlayPayload {
            position_seconds: position,
            at_timestamp: now,
        }))
    }

    pub fn pause(&mut self, now: f64) -> Result<SignalMessage, SyncError> {
        self.require_media()?;
        let position = self.state.position_at(now);
        self.state.is_playing = false;
        self.state.position_seconds = position;
        self.state.last_updated = now;
        Ok(SignalMessage::PlaybackPause(PositionPayload {
            position_seconds: position,
            at_timestamp: Some(now),
        }))
    }

    pub fn seek(&mut self, to_position: f64, now: f64) -> Result<SignalMessage, SyncError> {
        self.require_media()?;
        let position = validate_position(to_position)?;
        self.state.position_seconds = position;
        self.state.last_updated = now;
        Ok(SignalMessage::PlaybackSeek(PositionPayload {
            position_seconds: position,
            at_timestamp: Some(now),
        }))
    }

    /// Commands for the host's own player after one of its actions. They
    /// match what followers run for the same message.
    pub fn local_commands(&self, message: &SignalMessage, now: f64) -> Vec<PlayerCommand> {
        match message {
            SignalMessage::MediaSelected(p) if p.descriptor.is_none() => {
                vec![PlayerCommand::Unload]
            }
            SignalMessage::MediaSelected(p) => vec![
                PlayerCommand::Load(p.descriptor.clone()),
                PlayerCommand::SeekTo(self.state.position_at(now)),
                PlayerCommand::Pause,
            ],
            SignalMessage::PlaybackPlay(_) => vec![
                PlayerCommand::SeekTo(self.state.position_at(now)),
                PlayerCommand::Play,
            ],
            SignalMessage::PlaybackPause(_) => vec![
                PlayerCommand::SeekTo(self.state.position_seconds),
                PlayerCommand::Pause,
            ],
            SignalMessage::PlaybackSeek(_) => {
                vec![PlayerCommand::SeekTo(self.state.position_at(now))]
            }
            _ => Vec::new(),
        }
    }

    /// Answer to a `state-snapshot-request`
    pub fn snapshot_message(&self, now: f64) -> Result<SignalMessage, SyncError> {
        self.require_host()?;
        Ok(SignalMessage::StateSnapshot(SnapshotPayload {
            playback_state: self.snapshot(now),
        }))
    }

    /// Become host, seeding state from the newer of our mirror and the
    /// directory's snapshot
    pub fn promote(&mut self, directory_snapshot: Option<&PlaybackState>, now: f64) -> Promotion {
        self.host_id = self.local_id.clone();
        self.watermark = None;

        let mut commands = Vec::new();
        if let Some(snapshot) = directory_snapshot {
            if snapshot.last_updated > self.state.last_updated {
                commands = self.adopt(snapshot.clone(), now);
            }
        }
        self.state = self.state.extrapolated(now);

        Promotion {
            announce: SignalMessage::StateSnapshot(SnapshotPayload {
                playback_state: self.state.clone(),
            }),
            commands,
        }
    }

    // ========================================================================
    // Follower side
    // ========================================================================

    /// The local player finished loading the selected media
    pub fn media_ready(&mut self) -> bool {
        if self.phase == SyncPhase::MediaLoading {
            self.phase = SyncPhase::Ready;
            true
        } else {
            false
        }
    }

    /// Apply a playback message received from `from`
    pub fn apply(
        &mut self,
        from: &str,
        message: &SignalMessage,
        now: f64,
    ) -> Result<Vec<PlayerCommand>, Ignored> {
        if !message.requires_host() {
            return Err(Ignored::NotPlayback);
        }
        if self.is_host() {
            return Err(Ignored::LocalIsHost);
        }
        if from != self.host_id {
            warn!("Ignoring {} from non-host {}", message.kind(), from);
            return Err(Ignored::NotFromHost(from.to_string()));
        }

        match message {
            SignalMessage::PlaybackPlay(p) => {
                self.check_stale(p.at_timestamp)?;
                self.state.is_playing = true;
                self.state.position_seconds = p.position_seconds.max(0.0);
                self.state.last_updated = p.at_timestamp;
                Ok(vec![
                    PlayerCommand::SeekTo(self.state.position_at(now)),
                    PlayerCommand::Play,
                ])
            }
            SignalMessage::PlaybackPause(p) => {
                let at = p.at_timestamp.unwrap_or(now);
                self.check_stale(at)?;
                self.state.is_playing = false;
                self.state.position_seconds = p.position_seconds.max(0.0);
                self.state.last_updated = at;
                Ok(vec![
                    PlayerCommand::SeekTo(self.state.position_seconds),
                    PlayerCommand::Pause,
                ])
            }
            SignalMessage::PlaybackSeek(p) => {
                let at = p.at_timestamp.unwrap_or(now);
                self.check_stale(at)?;
                self.state.position_seconds = p.position_seconds.max(0.0);
                self.state.last_updated = at;
                Ok(vec![PlayerCommand::SeekTo(self.state.position_at(now))])
            }
            SignalMessage::MediaSelected(p) => {
                let at = p.at_timestamp.unwrap_or(now);
                self.check_stale(at)?;
                let state = PlaybackState {
                    media_descriptor: p.descriptor.clone(),
                    is_playing: false,
                    position_seconds: 0.0,
                    last_updated: at,
                };
                self.phase = SyncPhase::Idle;
                Ok(self.adopt(state, now))
            }
            SignalMessage::StateSnapshot(p) => {
                self.watermark = Some(p.playback_state.last_updated);
                Ok(self.adopt(p.playback_state.clone(), now))
            }
            _ => Err(Ignored::NotPlayback),
        }
    }

    /// Deviation of the local player from the mirror, if it exceeds the threshold
    pub fn check_drift(&self, local_position: f64, now: f64) -> Option<f64> {
        if self.is_host() || self.phase != SyncPhase::Ready {
            return None;
        }
        let deviation = (local_position - self.state.position_at(now)).abs();
        (deviation > self.drift_threshold).then_some(deviation)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn require_host(&self) -> Result<(), SyncError> {
        if self.is_host() {
            Ok(())
        } else {
            Err(SyncError::NotHost)
        }
    }

    fn require_media(&self) -> Result<(), SyncError> {
        self.require_host()?;
        if self.state.media_descriptor.is_none() {
            return Err(SyncError::NoMedia);
        }
        Ok(())
    }

    fn check_stale(&mut self, at: f64) -> Result<(), Ignored> {
        if let Some(watermark) = self.watermark {
            if at < watermark {
                return Err(Ignored::Stale { at, watermark });
            }
        }
        self.watermark = Some(at);
        Ok(())
    }

    /// Replace the whole state and work out what the player has to do
    fn adopt(&mut self, state: PlaybackState, now: f64) -> Vec<PlayerCommand> {
        let mut commands = Vec::new();
        if state.media_descriptor != self.state.media_descriptor || self.phase == SyncPhase::Idle {
            if state.media_descriptor.is_none() {
                commands.push(PlayerCommand::Unload);
                self.phase = SyncPhase::Idle;
            } else {
                commands.push(PlayerCommand::Load(state.media_descriptor.clone()));
                self.phase = SyncPhase::MediaLoading;
            }
        }
        self.state = state;
        if !self.state.media_descriptor.is_none() {
            commands.push(PlayerCommand::SeekTo(self.state.position_at(now)));
            commands.push(if self.state.is_playing {
                PlayerCommand::Play
            } else {
                PlayerCommand::Pause
            });
        }
        commands
    }
}

fn validate_position(position: f64) -> Result<f64, SyncError> {
    if position.is_finite() && position >= 0.0 {
        Ok(position)
    } else {
        Err(SyncError::InvalidPosition(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movie() -> MediaDescriptor {
        MediaDescriptor::file("movie.mp4", 50_000_000, "movie-1")
    }

    fn pair() -> (SyncEngine, SyncEngine) {
        let host = SyncEngine::new("alice", "alice", PlaybackState::default(), 2.0);
        let follower = SyncEngine::new("bob", "alice", PlaybackState::default(), 2.0);
        (host, follower)
    }

    #[test]
    fn test_play_is_latency_compensated() {
        let (mut host, mut follower) = pair();
        let selected = host.select_media(movie(), 1000.0).unwrap();
        let play = host.play(Some(0.0), 1000.0).unwrap();

        let cmds = follower.apply("alice", &selected, 1000.2).unwrap();
        assert_eq!(cmds[0], PlayerCommand::Load(movie()));
        assert_eq!(follower.phase(), SyncPhase::MediaLoading);

        // Delivered 1.5s after the host pressed play
        let cmds = follower.apply("alice", &play, 1001.5).unwrap();
        match cmds.as_slice() {
            [PlayerCommand::SeekTo(pos), PlayerCommand::Play] => {
                assert!((pos - 1.5).abs() < 1e-9)
            }
            other => panic!("unexpected commands: {other:?}"),
        }
        assert!(follower.state().is_playing);
    }

    #[test]
    fn test_host_runs_the_same_commands_as_followers() {
        let (mut host, mut follower) = pair();
        let mut check = |host: &SyncEngine, message: SignalMessage, now: f64| {
            let expected = follower.apply("alice", &message, now).unwrap();
            assert_eq!(host.local_commands(&message, now), expected);
        };

        let message = host.select_media(movie(), 10.0).unwrap();
        check(&host, message, 10.0);
        let message = host.play(Some(5.0), 11.0).unwrap();
        check(&host, message, 11.0);
        let message = host.seek(90.0, 12.0).unwrap();
        check(&host, message, 12.0);
        let message = host.pause(14.0).unwrap();
        assert_eq!(
            host.local_commands(&message, 14.0),
            vec![PlayerCommand::SeekTo(92.0), PlayerCommand::Pause]
        );
        check(&host, message, 14.0);
        let message = host.select_media(MediaDescriptor::default(), 15.0).unwrap();
        check(&host, message, 15.0);
    }

    #[test]
    fn test_seek_then_pause() {
        let (mut host, mut follower) = pair();
        follower
            .apply("alice", &host.select_media(movie(), 10.0).unwrap(), 10.0)
            .unwrap();
        follower
            .apply("alice", &host.play(None, 11.0).unwrap(), 11.0)
            .unwrap();
        follower
            .apply("alice", &host.seek(120.0, 20.0).unwrap(), 20.0)
            .unwrap();
        let cmds = follower
            .apply("alice", &host.pause(20.0).unwrap(), 20.1)
            .unwrap();

        assert_eq!(cmds, vec![PlayerCommand::SeekTo(120.0), PlayerCommand::Pause]);
        let state = follower.snapshot(50.0);
        assert!(!state.is_playing);
        assert_eq!(state.position_seconds, 120.0);
    }

    #[test]
    fn test_out_of_order_delta_is_stale() {
        let (mut host, mut follower) = pair();
        follower
            .apply("alice", &host.select_media(movie(), 1.0).unwrap(), 1.0)
            .unwrap();
        let early = host.seek(30.0, 2.0).unwrap();
        let late = host.seek(60.0, 3.0).unwrap();

        follower.apply("alice", &late, 3.0).unwrap();
        let result = follower.apply("alice", &early, 3.1);
        assert!(matches!(result, Err(Ignored::Stale { .. })));
        assert_eq!(follower.state().position_seconds, 60.0);
    }

    #[test]
    fn test_only_host_drives_playback() {
        let (mut host, mut follower) = pair();
        assert_eq!(follower.play(Some(0.0), 1.0), Err(SyncError::NotHost));
        assert_eq!(host.play(None, 1.0), Err(SyncError::NoMedia));
        host.select_media(movie(), 1.0).unwrap();
        assert_eq!(host.seek(-1.0, 1.0), Err(SyncError::InvalidPosition(-1.0)));

        let msg = host.pause(2.0).unwrap();
        assert_eq!(
            follower.apply("mallory", &msg, 2.0),
            Err(Ignored::NotFromHost("mallory".into()))
        );
        assert_eq!(host.apply("alice", &msg, 2.0), Err(Ignored::LocalIsHost));
        assert_eq!(
            follower.apply("alice", &SignalMessage::VoiceJoin, 2.0),
            Err(Ignored::NotPlayback)
        );
    }

    #[test]
    fn test_snapshot_applies_unconditionally() {
        let (mut host, mut follower) = pair();
        host.select_media(movie(), 100.0).unwrap();
        host.play(Some(0.0), 100.0).unwrap();
        follower
            .apply("alice", &host.seek(500.0, 200.0).unwrap(), 200.0)
            .unwrap();

        // Snapshot anchored earlier than the last delta still wins
        let snapshot = SignalMessage::StateSnapshot(SnapshotPayload {
            playback_state: PlaybackState {
                media_descriptor: movie(),
                is_playing: true,
                position_seconds: 30.0,
                last_updated: 130.0,
            },
        });
        let cmds = follower.apply("alice", &snapshot, 130.0).unwrap();
        assert_eq!(cmds.last(), Some(&PlayerCommand::Play));
        assert!((follower.snapshot(130.0).position_seconds - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_drift_detection() {
        let (mut host, mut follower) = pair();
        follower
            .apply("alice", &host.select_media(movie(), 0.0).unwrap(), 0.0)
            .unwrap();
        follower
            .apply("alice", &host.play(Some(10.0), 0.0).unwrap(), 0.0)
            .unwrap();
        // Still loading
        assert_eq!(follower.check_drift(0.0, 5.0), None);
        assert!(follower.media_ready());

        assert_eq!(follower.check_drift(14.0, 5.0), None);
        assert_eq!(follower.check_drift(18.0, 5.0), Some(3.0));
        assert_eq!(host.check_drift(100.0, 5.0), None);
    }

    #[test]
    fn test_promotion_prefers_newer_snapshot() {
        let (mut host, mut follower) = pair();
        follower
            .apply("alice", &host.select_media(movie(), 10.0).unwrap(), 10.0)
            .unwrap();

        let directory = PlaybackState {
            media_descriptor: movie(),
            is_playing: true,
            position_seconds: 40.0,
            last_updated: 50.0,
        };
        let promotion = follower.promote(Some(&directory), 60.0);
        assert!(follower.is_host());
        match promotion.announce {
            SignalMessage::StateSnapshot(p) => {
                assert!(p.playback_state.is_playing);
                assert!((p.playback_state.position_seconds - 50.0).abs() < 1e-9);
                assert_eq!(p.playback_state.last_updated, 60.0);
            }
            other => panic!("unexpected announcement: {other:?}"),
        }
        assert!(promotion.commands.contains(&PlayerCommand::Play));

        // An older directory snapshot does not override the mirror
        let (_, mut other) = pair();
        let stale = PlaybackState {
            last_updated: 0.0,
            ..directory
        };
        let promotion = other.promote(Some(&stale), 60.0);
        assert!(promotion.commands.is_empty());
    }
}
