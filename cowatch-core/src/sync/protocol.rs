//! Playback Data Model
//!
//! The state a host owns and followers mirror. Positions and timestamps are
//! float seconds; timestamps are seconds since the UNIX epoch.

use serde::{Deserialize, Serialize};

/// What kind of source the room is watching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Nothing selected
    #[default]
    None,
    /// A shared screen, delivered over direct peer links
    Screen,
    /// A file picked by the host
    File,
    /// A URL every participant streams on its own
    Stream,
}

/// Describes the currently selected media
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    /// Display name (file name, stream title, screen label)
    pub name: String,
    /// Size in bytes, 0 when unknown or not applicable
    #[serde(default)]
    pub size: u64,
    /// Where to load it from (URL, transfer id, track id)
    #[serde(default)]
    pub locator: String,
}

impl MediaDescriptor {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn file(name: impl Into<String>, size: u64, locator: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::File,
            name: name.into(),
            size,
            locator: locator.into(),
        }
    }

    pub fn stream(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Stream,
            name: name.into(),
            size: 0,
            locator: url.into(),
        }
    }

    pub fn screen(name: impl Into<String>, track_id: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Screen,
            name: name.into(),
            size: 0,
            locator: track_id.into(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == MediaKind::None
    }
}

/// Canonical playback state of a room
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub media_descriptor: MediaDescriptor,
    pub is_playing: bool,
    /// Position at `last_updated`
    pub position_seconds: f64,
    /// Host timestamp at which `position_seconds` was captured
    pub last_updated: f64,
}

impl PlaybackState {
    /// Position at time `now`, advancing with wall time while playing
    pub fn position_at(&self, now: f64) -> f64 {
        if self.is_playing {
            self.position_seconds + (now - self.last_updated).max(0.0)
        } else {
            self.position_seconds
        }
    }

    /// Copy of this state re-anchored at `now`
    pub fn extrapolated(&self, now: f64) -> Self {
        Self {
            media_descriptor: self.media_descriptor.clone(),
            is_playing: self.is_playing,
            position_seconds: self.position_at(now),
            last_updated: now.max(self.last_updated),
        }
    }
}

/// Get current time in seconds since UNIX epoch
pub fn current_time_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
