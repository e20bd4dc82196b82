//! Per-connection relay loop
//!
//! Transport-agnostic: the WebSocket front-end and the in-process link both
//! feed decoded client frames in and drain the member's lanes out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::frame::{ClientFrame, RelayError};
use super::hub::{ConnectionId, MemberSender, RelayHub};
use crate::api::{ApiError, AuthVerifier, RoomService};
use crate::directory::Participant;
use crate::sync::{Clock, SystemClock};

/// Default time a dropped member keeps its seat
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(5);

/// Collaborators consulted while admitting members
#[derive(Clone)]
pub struct RelayServices {
    pub auth: Arc<dyn AuthVerifier>,
    /// Without a room service, rooms are created on first join
    pub rooms: Option<Arc<dyn RoomService>>,
    pub reconnect_grace: Duration,
    pub clock: Arc<dyn Clock>,
}

impl RelayServices {
    pub fn new(auth: Arc<dyn AuthVerifier>) -> Self {
        Self {
            auth,
            rooms: None,
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_rooms(mut self, rooms: Arc<dyn RoomService>) -> Self {
        self.rooms = Some(rooms);
        self
    }

    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check a join request against the auth and room services
    async fn admit(
        &self,
        room_id: &str,
        token: &str,
        display_name: String,
        avatar: Option<String>,
    ) -> Result<Participant, RelayError> {
        let user_id = self.auth.verify_token(token).await.map_err(|e| match e {
            ApiError::Unauthorized => RelayError::AuthFailure("invalid token".into()),
            other => RelayError::Unavailable(other.to_string()),
        })?;

        if let Some(rooms) = &self.rooms {
            let unavailable = |e: ApiError| RelayError::Unavailable(e.to_string());
            if rooms.get_room(room_id).await.map_err(unavailable)?.is_none() {
                return Err(RelayError::RoomNotFound(room_id.to_string()));
            }
            let allowed = rooms.get_participants(room_id).await.map_err(unavailable)?;
            if !allowed.is_empty() && !allowed.iter().any(|p| p.user_id == user_id) {
                return Err(RelayError::AuthFailure(format!(
                    "{} is not a member of {}",
                    user_id, room_id
                )));
            }
        }

        let display_name = if display_name.trim().is_empty() {
            user_id.clone()
        } else {
            display_name
        };
        Ok(Participant::new(user_id, display_name, self.clock.now()).with_avatar(avatar))
    }
}

/// Drive one member connection until it leaves or drops
pub async fn serve_member(
    hub: Arc<RelayHub>,
    services: RelayServices,
    mut frames: mpsc::UnboundedReceiver<ClientFrame>,
    sender: MemberSender,
) {
    // The first frame must be a join
    let (room_id, user_id, connection) = match frames.recv().await {
        Some(ClientFrame::Join {
            room_id,
            token,
            display_name,
            avatar,
        }) => match services.admit(&room_id, &token, display_name, avatar).await {
            Ok(participant) => {
                let user_id = participant.user_id.clone();
                let connection = hub.join(&room_id, participant, sender.clone());
                (room_id, user_id, connection)
            }
            Err(e) => {
                info!("Join to {} refused: {}", room_id, e);
                hub.send_error(&sender, &e);
                return;
            }
        },
        Some(_) => {
            hub.send_error(&sender, &RelayError::NotJoined);
            return;
        }
        None => return,
    };

    while let Some(frame) = frames.recv().await {
        if !hub.holds_seat(&room_id, &user_id, connection) {
            info!("{} in {} was replaced by a newer connection", user_id, room_id);
            return;
        }
        match handle_frame(&hub, &room_id, &user_id, connection, frame) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => hub.send_error(&sender, &e),
        }
    }

    // Dropped without a leave
    drop(sender);
    if hub.disconnected(&room_id, &user_id, connection) {
        tokio::time::sleep(services.reconnect_grace).await;
        if hub.expire(&room_id, &user_id, connection) {
            debug!("{} did not come back to {}", user_id, room_id);
        }
    }
}

/// Returns false once the member has left
fn handle_frame(
    hub: &RelayHub,
    room_id: &str,
    user_id: &str,
    connection: ConnectionId,
    frame: ClientFrame,
) -> Result<bool, RelayError> {
    match frame {
        ClientFrame::Leave => {
            hub.leave(room_id, user_id, connection);
            Ok(false)
        }
        ClientFrame::Signal { to, lane, envelope } => {
            match to {
                Some(to) => {
                    hub.send_to(room_id, user_id, &to, envelope, lane)?;
                }
                None => {
                    hub.broadcast(room_id, user_id, envelope, lane)?;
                }
            }
            Ok(true)
        }
        ClientFrame::PublishState { playback } => {
            hub.publish_state(room_id, user_id, playback)?;
            Ok(true)
        }
        ClientFrame::TransferHost { user_id: to } => {
            hub.transfer_host(room_id, user_id, &to)?;
            Ok(true)
        }
        ClientFrame::Join { .. } => {
            warn!("{} sent a second join", user_id);
            Err(RelayError::BadFrame("already joined".into()))
        }
    }
}
