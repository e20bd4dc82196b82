//! Relay Hub
//!
//! Room-scoped store-and-forward. Owns the room directory and one outbound
//! lane pair per connected member. All state sits behind a single lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::frame::{RelayError, RelayErrorKind, ServerFrame};
use super::lanes::{Lane, LaneError, LaneSender};
use crate::directory::{LeaveOutcome, Participant, RoomDirectory};
use crate::sync::PlaybackState;

/// Outbound queue of one member
pub type MemberSender = LaneSender<ServerFrame>;

/// Identifies one connection of a member, so that a late cleanup of a
/// replaced connection never touches the new one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Hooks for metrics and dashboards. Every method defaults to a no-op.
pub trait RelayObserver: Send + Sync {
    fn member_joined(&self, _room_id: &str, _user_id: &str, _room_created: bool) {}
    fn member_left(&self, _room_id: &str, _user_id: &str, _room_closed: bool) {}
    fn member_reconnecting(&self, _room_id: &str, _user_id: &str) {}
    fn host_changed(&self, _room_id: &str, _host_id: &str) {}
    fn relayed(&self, _lane: Lane, _bytes: usize, _recipients: usize) {}
    fn dropped(&self, _lane: Lane) {}
    fn rejected(&self, _kind: RelayErrorKind, _message: &str) {}
}

struct Member {
    connection: ConnectionId,
    /// `None` while the member is reconnecting
    sender: Option<MemberSender>,
}

#[derive(Default)]
struct HubState {
    directory: RoomDirectory,
    members: HashMap<String, HashMap<String, Member>>,
    next_connection: u64,
}

impl HubState {
    fn roster_frame(&self, room_id: &str) -> Option<ServerFrame> {
        self.directory.room(room_id).map(|room| ServerFrame::Roster {
            roster: room.roster.clone(),
            host_id: room.host_id.clone(),
            playback: room.playback.clone(),
        })
    }

    /// Send the current roster to every live member except `skip`
    fn notify_roster(&self, room_id: &str, skip: Option<&str>) {
        let (Some(frame), Some(members)) = (self.roster_frame(room_id), self.members.get(room_id))
        else {
            return;
        };
        for (user_id, member) in members {
            if Some(user_id.as_str()) == skip {
                continue;
            }
            if let Some(sender) = &member.sender {
                let _ = sender.send(frame.clone(), Lane::Control);
            }
        }
    }

    fn forget(&mut self, room_id: &str, user_id: &str) {
        if let Some(members) = self.members.get_mut(room_id) {
            members.remove(user_id);
            if members.is_empty() {
                self.members.remove(room_id);
            }
        }
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub rooms: usize,
    pub participants: usize,
    pub connected: usize,
}

pub struct RelayHub {
    state: Mutex<HubState>,
    observer: Option<Arc<dyn RelayObserver>>,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            observer: None,
        }
    }

    pub fn with_observer(observer: Arc<dyn RelayObserver>) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            observer: Some(observer),
        }
    }

    fn observe(&self, f: impl FnOnce(&dyn RelayObserver)) {
        if let Some(observer) = &self.observer {
            f(observer.as_ref());
        }
    }

    pub(crate) fn reject(&self, error: &RelayError) {
        if let Some(kind) = error.kind() {
            self.observe(|o| o.rejected(kind, &error.to_string()));
        }
    }

    pub fn stats(&self) -> HubStats {
        let state = self.state.lock();
        HubStats {
            rooms: state.directory.room_count(),
            participants: state.directory.participant_count(),
            connected: state
                .members
                .values()
                .flat_map(|m| m.values())
                .filter(|m| m.sender.is_some())
                .count(),
        }
    }

    /// Roster of a room, in join order
    pub fn roster(&self, room_id: &str) -> Option<Vec<Participant>> {
        self.state.lock().directory.roster(room_id).map(|r| r.to_vec())
    }

    /// Add a member. The joiner receives `joined` before anything else is
    /// queued for it; everyone else receives the new roster.
    pub fn join(&self, room_id: &str, participant: Participant, sender: MemberSender) -> ConnectionId {
        let user_id = participant.user_id.clone();
        let mut state = self.state.lock();

        let outcome = state.directory.join(room_id, participant);
        state.next_connection += 1;
        let connection = ConnectionId(state.next_connection);

        let _ = sender.send(
            ServerFrame::Joined {
                room_id: room_id.to_string(),
                user_id: user_id.clone(),
                roster: outcome.roster,
                host_id: outcome.host_id,
                playback: outcome.playback,
            },
            Lane::Control,
        );
        state
            .members
            .entry(room_id.to_string())
            .or_default()
            .insert(
                user_id.clone(),
                Member {
                    connection,
                    sender: Some(sender),
                },
            );
        state.notify_roster(room_id, Some(&user_id));
        drop(state);

        info!("{} joined room {} ({:?})", user_id, room_id, connection);
        self.observe(|o| o.member_joined(room_id, &user_id, outcome.created));
        connection
    }

    /// Explicit leave
    pub fn leave(&self, room_id: &str, user_id: &str, connection: ConnectionId) -> bool {
        let mut state = self.state.lock();
        if !Self::is_current(&state, room_id, user_id, connection) {
            return false;
        }
        state.forget(room_id, user_id);
        let outcome = state.directory.leave(room_id, user_id);
        if let Ok(outcome) = &outcome {
            state.notify_roster(room_id, None);
            drop(state);
            self.after_departure(room_id, user_id, outcome);
        }
        true
    }

    /// Connection dropped without a leave. Returns true if the member is now
    /// waiting out its reconnect grace.
    pub fn disconnected(&self, room_id: &str, user_id: &str, connection: ConnectionId) -> bool {
        let mut state = self.state.lock();
        if !Self::is_current(&state, room_id, user_id, connection) {
            return false;
        }
        if let Some(member) = state
            .members
            .get_mut(room_id)
            .and_then(|m| m.get_mut(user_id))
        {
            member.sender = None;
        }
        if state.directory.mark_reconnecting(room_id, user_id).is_err() {
            return false;
        }
        state.notify_roster(room_id, None);
        drop(state);

        debug!("{} in room {} is reconnecting", user_id, room_id);
        self.observe(|o| o.member_reconnecting(room_id, user_id));
        true
    }

    /// Grace period over. Removes the member unless it came back on a newer
    /// connection.
    pub fn expire(&self, room_id: &str, user_id: &str, connection: ConnectionId) -> bool {
        let mut state = self.state.lock();
        if !Self::is_current(&state, room_id, user_id, connection) {
            return false;
        }
        match state.directory.expire(room_id, user_id) {
            Ok(Some(outcome)) => {
                state.forget(room_id, user_id);
                state.notify_roster(room_id, None);
                drop(state);
                info!("{} timed out of room {}", user_id, room_id);
                self.after_departure(room_id, user_id, &outcome);
                true
            }
            _ => false,
        }
    }

    fn after_departure(&self, room_id: &str, user_id: &str, outcome: &LeaveOutcome) {
        self.observe(|o| o.member_left(room_id, user_id, outcome.room_closed));
        if let Some(host) = &outcome.new_host {
            self.observe(|o| o.host_changed(room_id, host));
        }
    }

    /// Whether `connection` still holds the member's seat. A newer join from
    /// the same user replaces it.
    pub fn holds_seat(&self, room_id: &str, user_id: &str, connection: ConnectionId) -> bool {
        Self::is_current(&self.state.lock(), room_id, user_id, connection)
    }

    fn is_current(state: &HubState, room_id: &str, user_id: &str, connection: ConnectionId) -> bool {
        state
            .members
            .get(room_id)
            .and_then(|m| m.get(user_id))
            .is_some_and(|m| m.connection == connection)
    }

    /// Fan an envelope out to every live member except the sender. Returns
    /// the number of members it was queued for.
    pub fn broadcast(
        &self,
        room_id: &str,
        from: &str,
        envelope: String,
        lane: Lane,
    ) -> Result<usize, RelayError> {
        let bytes = envelope.len();
        let state = self.state.lock();
        let members = state
            .members
            .get(room_id)
            .ok_or_else(|| RelayError::RoomNotFound(room_id.to_string()))?;

        let frame = ServerFrame::Signal {
            from: from.to_string(),
            envelope,
        };
        let mut delivered = 0;
        let mut dropped = 0;
        for (user_id, member) in members {
            if user_id == from {
                continue;
            }
            let Some(sender) = &member.sender else {
                continue;
            };
            match sender.send(frame.clone(), lane) {
                Ok(()) => delivered += 1,
                Err(LaneError::Full) => dropped += 1,
                Err(LaneError::Closed) => {}
            }
        }
        drop(state);

        for _ in 0..dropped {
            self.observe(|o| o.dropped(lane));
        }
        self.observe(|o| o.relayed(lane, bytes, delivered));
        Ok(delivered)
    }

    /// Unicast. An absent target is not an error; returns whether the
    /// envelope was queued.
    pub fn send_to(
        &self,
        room_id: &str,
        from: &str,
        to: &str,
        envelope: String,
        lane: Lane,
    ) -> Result<bool, RelayError> {
        let bytes = envelope.len();
        let state = self.state.lock();
        let members = state
            .members
            .get(room_id)
            .ok_or_else(|| RelayError::RoomNotFound(room_id.to_string()))?;

        let Some(sender) = members.get(to).and_then(|m| m.sender.as_ref()) else {
            debug!("Dropping signal for absent {} in room {}", to, room_id);
            return Ok(false);
        };
        let result = sender.send(
            ServerFrame::Signal {
                from: from.to_string(),
                envelope,
            },
            lane,
        );
        drop(state);

        match result {
            Ok(()) => {
                self.observe(|o| o.relayed(lane, bytes, 1));
                Ok(true)
            }
            Err(LaneError::Full) => {
                self.observe(|o| o.dropped(lane));
                Ok(false)
            }
            Err(LaneError::Closed) => Ok(false),
        }
    }

    /// Store the host's playback snapshot for future joiners
    pub fn publish_state(
        &self,
        room_id: &str,
        from: &str,
        playback: PlaybackState,
    ) -> Result<(), RelayError> {
        self.state
            .lock()
            .directory
            .publish_snapshot(room_id, from, playback)?;
        Ok(())
    }

    pub fn transfer_host(&self, room_id: &str, from: &str, to: &str) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        state.directory.transfer_host(room_id, from, to)?;
        state.notify_roster(room_id, None);
        drop(state);

        self.observe(|o| o.host_changed(room_id, to));
        Ok(())
    }

    /// Report a frame-level problem to one member
    pub fn send_error(&self, sender: &MemberSender, error: &RelayError) {
        if let Some(frame) = error.to_frame() {
            warn!("Rejecting frame: {}", error);
            let _ = sender.send(frame, Lane::Control);
        }
        self.reject(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::lanes::{lanes, LaneReceiver};
    use futures::FutureExt;

    fn member(hub: &RelayHub, user: &str, at: f64) -> (ConnectionId, LaneReceiver<ServerFrame>) {
        let (tx, rx) = lanes(4);
        let id = hub.join("ROOM", Participant::new(user, user, at), tx);
        (id, rx)
    }

    async fn next(rx: &mut LaneReceiver<ServerFrame>) -> ServerFrame {
        rx.recv().await.map(|(f, _)| f).unwrap()
    }

    #[tokio::test]
    async fn test_join_then_roster() {
        let hub = RelayHub::new();
        let (_, mut alice) = member(&hub, "alice", 1.0);
        assert!(matches!(next(&mut alice).await, ServerFrame::Joined { host_id, .. } if host_id == "alice"));

        let (_, mut bob) = member(&hub, "bob", 2.0);
        match next(&mut bob).await {
            ServerFrame::Joined { roster, host_id, .. } => {
                assert_eq!(roster.len(), 2);
                assert_eq!(host_id, "alice");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(matches!(next(&mut alice).await, ServerFrame::Roster { roster, .. } if roster.len() == 2));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = RelayHub::new();
        let (_, mut alice) = member(&hub, "alice", 1.0);
        let (_, mut bob) = member(&hub, "bob", 2.0);
        next(&mut alice).await;
        next(&mut alice).await;
        next(&mut bob).await;

        let n = hub.broadcast("ROOM", "alice", "hello".into(), Lane::Control).unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            next(&mut bob).await,
            ServerFrame::Signal {
                from: "alice".into(),
                envelope: "hello".into()
            }
        );
        assert!(alice.recv().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_unknown_room() {
        let hub = RelayHub::new();
        assert!(matches!(
            hub.broadcast("NOPE", "a", "x".into(), Lane::Control),
            Err(RelayError::RoomNotFound(_))
        ));
        assert!(matches!(
            hub.send_to("NOPE", "a", "b", "x".into(), Lane::Control),
            Err(RelayError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_full_bulk_lane_drops_chunks() {
        let hub = RelayHub::new();
        let (_, _alice) = member(&hub, "alice", 1.0);
        let (tx, mut bob_rx) = lanes(1);
        hub.join("ROOM", Participant::new("bob", "bob", 2.0), tx);
        next(&mut bob_rx).await;

        assert!(hub.send_to("ROOM", "alice", "bob", "c0".into(), Lane::Bulk).unwrap());
        assert!(!hub.send_to("ROOM", "alice", "bob", "c1".into(), Lane::Bulk).unwrap());
        // Control still gets through
        assert!(hub.send_to("ROOM", "alice", "bob", "ctl".into(), Lane::Control).unwrap());
        assert!(matches!(next(&mut bob_rx).await, ServerFrame::Signal { envelope, .. } if envelope == "ctl"));
    }

    #[tokio::test]
    async fn test_stale_expiry_is_ignored() {
        let hub = RelayHub::new();
        let (first, _a1) = member(&hub, "alice", 1.0);
        let (_, _bob) = member(&hub, "bob", 2.0);

        assert!(hub.disconnected("ROOM", "alice", first));
        let (second, _a2) = member(&hub, "alice", 3.0);
        assert!(!hub.expire("ROOM", "alice", first));
        assert_eq!(hub.roster("ROOM").unwrap().len(), 2);

        assert!(hub.disconnected("ROOM", "alice", second));
        assert!(hub.expire("ROOM", "alice", second));
        let roster = hub.roster("ROOM").unwrap();
        assert_eq!(roster.len(), 1);
        assert!(roster[0].is_host);
        assert_eq!(hub.stats().rooms, 1);
    }

    #[tokio::test]
    async fn test_publish_and_transfer_are_host_only() {
        let hub = RelayHub::new();
        let (_, _a) = member(&hub, "alice", 1.0);
        let (_, _b) = member(&hub, "bob", 2.0);

        assert!(matches!(
            hub.publish_state("ROOM", "bob", PlaybackState::default()),
            Err(RelayError::NotHost(_))
        ));
        hub.transfer_host("ROOM", "alice", "bob").unwrap();
        hub.publish_state("ROOM", "bob", PlaybackState::default()).unwrap();
    }
}
