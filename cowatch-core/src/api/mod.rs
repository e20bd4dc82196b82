//! External Collaborators
//!
//! The room directory and auth services the relay consults on join.

mod client;
mod types;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

pub use client::{ApiClient, HttpAuthVerifier, HttpRoomService, InsecureTokenVerifier};
pub use types::{ParticipantRecord, RoomRecord};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service is not reachable")]
    NotReachable,

    #[error("Invalid or expired token")]
    Unauthorized,

    #[error("API error: {0}")]
    Api(String),
}

/// Turns a client token into a user id
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<String, ApiError>;
}

/// Room CRUD lives elsewhere; the relay only reads
#[async_trait]
pub trait RoomService: Send + Sync {
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, ApiError>;

    /// Users allowed in the room. Empty means unrestricted.
    async fn get_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>, ApiError>;
}

/// Fixed set of rooms held in memory
#[derive(Debug, Default)]
pub struct StaticRoomService {
    rooms: RwLock<HashMap<String, Vec<ParticipantRecord>>>,
}

impl StaticRoomService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a room with an optional allow-list of user ids
    pub fn add_room(&self, room_id: impl Into<String>, allowed: &[&str]) {
        let records = allowed
            .iter()
            .map(|id| ParticipantRecord {
                user_id: id.to_string(),
                display_name: None,
                avatar: None,
            })
            .collect();
        self.rooms.write().insert(room_id.into(), records);
    }
}

#[async_trait]
impl RoomService for StaticRoomService {
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, ApiError> {
        Ok(self.rooms.read().get(room_id).map(|_| RoomRecord {
            id: room_id.to_string(),
            name: None,
            owner_id: None,
        }))
    }

    async fn get_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>, ApiError> {
        Ok(self.rooms.read().get(room_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insecure_verifier() {
        let verifier = InsecureTokenVerifier;
        assert_eq!(verifier.verify_token(" alice ").await.unwrap(), "alice");
        assert!(matches!(
            verifier.verify_token("").await,
            Err(ApiError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_static_rooms() {
        let rooms = StaticRoomService::new();
        rooms.add_room("MOVIE", &["alice", "bob"]);
        assert!(rooms.get_room("MOVIE").await.unwrap().is_some());
        assert!(rooms.get_room("OTHER").await.unwrap().is_none());
        let allowed = rooms.get_participants("MOVIE").await.unwrap();
        assert_eq!(allowed.len(), 2);
        assert_eq!(allowed[1].user_id, "bob");
    }

    #[test]
    fn test_client_normalizes_base_url() {
        let client = ApiClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
