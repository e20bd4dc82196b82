//! Roster entries

use serde::{Deserialize, Serialize};

/// Connectivity of a participant as seen by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Connected,
    /// Connection dropped, waiting for the participant to come back
    Reconnecting,
    Disconnected,
}

/// A member of a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Seconds since UNIX epoch
    pub joined_at: f64,
    pub is_host: bool,
    #[serde(default)]
    pub status: ConnectionStatus,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>, joined_at: f64) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar: None,
            joined_at,
            is_host: false,
            status: ConnectionStatus::Connected,
        }
    }

    pub fn with_avatar(mut self, avatar: Option<String>) -> Self {
        self.avatar = avatar;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}
