//! Room Session Directory
//!
//! Rooms by id, each with an ordered roster, exactly one host and the last
//! canonical playback snapshot the host published. Rooms exist while they
//! have members.

mod participant;
mod room_id;

use std::collections::HashMap;

use tracing::{debug, info};

pub use participant::{ConnectionStatus, Participant};
pub use room_id::{InvalidRoomId, RoomId};

use crate::sync::PlaybackState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("{0} is not the host")]
    NotHost(String),
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),
}

/// One room's shared state
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    /// Join order
    pub roster: Vec<Participant>,
    pub host_id: String,
    pub playback: PlaybackState,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            roster: Vec::new(),
            host_id: String::new(),
            playback: PlaybackState::default(),
        }
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.roster.iter().find(|p| p.user_id == user_id)
    }

    fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.roster.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participant(user_id).is_some()
    }

    /// Earliest-joined connected participant, else the earliest of anyone
    fn elect_host(&self) -> Option<String> {
        let earliest = |a: &&Participant, b: &&Participant| a.joined_at.total_cmp(&b.joined_at);
        self.roster
            .iter()
            .filter(|p| p.is_connected())
            .min_by(earliest)
            .or_else(|| self.roster.iter().min_by(earliest))
            .map(|p| p.user_id.clone())
    }

    fn set_host(&mut self, user_id: &str) {
        for p in &mut self.roster {
            p.is_host = p.user_id == user_id;
        }
        self.host_id = user_id.to_string();
    }
}

/// What a join did
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub roster: Vec<Participant>,
    pub host_id: String,
    pub playback: PlaybackState,
    /// The room did not exist before
    pub created: bool,
    /// An older record for the same user was replaced
    pub replaced: bool,
}

/// What a departure did
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub removed: Participant,
    /// Set when the departing participant was host and someone took over
    pub new_host: Option<String>,
    /// The roster became empty and the room is gone
    pub room_closed: bool,
}

#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<String, Room>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn roster(&self, room_id: &str) -> Option<&[Participant]> {
        self.rooms.get(room_id).map(|r| r.roster.as_slice())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn participant_count(&self) -> usize {
        self.rooms.values().map(|r| r.roster.len()).sum()
    }

    /// Add a participant, creating the room on first join. A second join from
    /// the same user replaces the older record in place.
    pub fn join(&mut self, room_id: &str, mut participant: Participant) -> JoinOutcome {
        let created = !self.rooms.contains_key(room_id);
        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id));

        participant.status = ConnectionStatus::Connected;
        let user_id = participant.user_id.clone();
        let replaced = match room.participant_mut(&user_id) {
            Some(existing) => {
                participant.is_host = existing.is_host;
                *existing = participant;
                true
            }
            None => {
                participant.is_host = false;
                room.roster.push(participant);
                false
            }
        };

        if room.host_id.is_empty() {
            room.set_host(&user_id);
        }

        if created {
            info!("Room {} created by {}", room_id, user_id);
        } else {
            debug!("{} joined room {} (replaced={})", user_id, room_id, replaced);
        }

        JoinOutcome {
            roster: room.roster.clone(),
            host_id: room.host_id.clone(),
            playback: room.playback.clone(),
            created,
            replaced,
        }
    }

    /// Remove a participant, electing a new host if needed
    pub fn leave(&mut self, room_id: &str, user_id: &str) -> Result<LeaveOutcome, DirectoryError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| DirectoryError::RoomNotFound(room_id.to_string()))?;
        let index = room
            .roster
            .iter()
            .position(|p| p.user_id == user_id)
            .ok_or_else(|| DirectoryError::UnknownParticipant(user_id.to_string()))?;

        let mut removed = room.roster.remove(index);
        removed.status = ConnectionStatus::Disconnected;

        if room.roster.is_empty() {
            info!("Room {} closed", room_id);
            self.rooms.remove(room_id);
            return Ok(LeaveOutcome {
                removed,
                new_host: None,
                room_closed: true,
            });
        }

        let mut new_host = None;
        if room.host_id == user_id {
            if let Some(next) = room.elect_host() {
                info!("Host {} left room {}, promoting {}", user_id, room_id, next);
                room.set_host(&next);
                new_host = Some(next);
            }
        }

        Ok(LeaveOutcome {
            removed,
            new_host,
            room_closed: false,
        })
    }

    /// Connection dropped without a leave. The record, host flag included,
    /// stays until the participant comes back or is expired.
    pub fn mark_reconnecting(&mut self, room_id: &str, user_id: &str) -> Result<(), DirectoryError> {
        let participant = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| DirectoryError::RoomNotFound(room_id.to_string()))?
            .participant_mut(user_id)
            .ok_or_else(|| DirectoryError::UnknownParticipant(user_id.to_string()))?;
        participant.status = ConnectionStatus::Reconnecting;
        Ok(())
    }

    /// Remove a participant whose grace period ran out. Does nothing if they
    /// reconnected in the meantime.
    pub fn expire(
        &mut self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Option<LeaveOutcome>, DirectoryError> {
        let still_gone = self
            .rooms
            .get(room_id)
            .ok_or_else(|| DirectoryError::RoomNotFound(room_id.to_string()))?
            .participant(user_id)
            .is_some_and(|p| p.status == ConnectionStatus::Reconnecting);
        if !still_gone {
            return Ok(None);
        }
        self.leave(room_id, user_id).map(Some)
    }

    /// Hand the host role to another member
    pub fn transfer_host(
        &mut self,
        room_id: &str,
        from: &str,
        to: &str,
    ) -> Result<(), DirectoryError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| DirectoryError::RoomNotFound(room_id.to_string()))?;
        if room.host_id != from {
            return Err(DirectoryError::NotHost(from.to_string()));
        }
        if !room.contains(to) {
            return Err(DirectoryError::UnknownParticipant(to.to_string()));
        }
        info!("Host of room {} transferred: {} -> {}", room_id, from, to);
        room.set_host(to);
        Ok(())
    }

    /// Store the host's canonical playback state
    pub fn publish_snapshot(
        &mut self,
        room_id: &str,
        from: &str,
        playback: PlaybackState,
    ) -> Result<(), DirectoryError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| DirectoryError::RoomNotFound(room_id.to_string()))?;
        if room.host_id != from {
            return Err(DirectoryError::NotHost(from.to_string()));
        }
        room.playback = playback;
        Ok(())
    }
}
