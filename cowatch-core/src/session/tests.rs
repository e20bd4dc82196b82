use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::api::{InsecureTokenVerifier, StaticRoomService};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent, Subscription};
use crate::peer::NoopBackend;
use crate::relay::{
    lanes, ClientFrame, Lane, RelayHub, RelayLink, RelaySender, RelayServices, ServerFrame,
};
use crate::signaling::{decode, encode, ChunkPayload, Envelope, SignalMessage};
use crate::sync::{ManualClock, MediaDescriptor, PlaybackState, PlayerCommand};

const ROOM: &str = "ROOMCODE";

struct TestRoom {
    hub: Arc<RelayHub>,
    services: RelayServices,
    clock: ManualClock,
}

impl TestRoom {
    fn new() -> Self {
        let clock = ManualClock::new(1_000.0);
        let services = RelayServices::new(Arc::new(InsecureTokenVerifier))
            .with_clock(Arc::new(clock.clone()));
        Self {
            hub: Arc::new(RelayHub::new()),
            services,
            clock,
        }
    }

    fn config(&self) -> SessionConfig {
        SessionConfig::default().with_clock(Arc::new(self.clock.clone()))
    }

    /// A member driven by hand, with no session behind it
    async fn raw_member(
        &self,
        user: &str,
    ) -> (RelaySender, mpsc::UnboundedReceiver<ServerFrame>) {
        let (sender, mut inbound) = self.hub.connect_local(self.services.clone(), 16).split();
        sender
            .send(
                ClientFrame::Join {
                    room_id: ROOM.into(),
                    token: user.into(),
                    display_name: user.into(),
                    avatar: None,
                },
                Lane::Control,
            )
            .unwrap();
        assert!(matches!(
            inbound.recv().await,
            Some(ServerFrame::Joined { .. })
        ));
        (sender, inbound)
    }

    async fn join(&self, user: &str) -> (RoomSession, Subscription<SessionEvent>) {
        let link = self.hub.connect_local(self.services.clone(), 64);
        let events = EventBus::new();
        let subscription = events.subscribe();
        let session = RoomSession::join_with(
            self.config(),
            link,
            JoinRequest::new(ROOM, user, user),
            Arc::new(NoopBackend),
            events,
        )
        .await
        .unwrap();
        (session, subscription)
    }
}

async fn wait_for(
    events: &mut Subscription<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn synchronized(events: &mut Subscription<SessionEvent>) {
    wait_for(events, |e| *e == SessionEvent::Synchronized).await;
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn movie() -> MediaDescriptor {
    MediaDescriptor::file("movie.mkv", 50_000_000, "media-1")
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_lands_at_extrapolated_position() {
    let room = TestRoom::new();
    let (alice, mut alice_events) = room.join("alice").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Joined { is_host: true, .. })
    })
    .await;

    alice.select_media(movie()).await.unwrap();
    alice.play(Some(0.0)).await.unwrap();
    room.clock.advance(30.0);

    let (bob, mut bob_events) = room.join("bob").await;
    wait_for(&mut bob_events, |e| {
        *e == SessionEvent::Player(PlayerCommand::Load(movie()))
    })
    .await;
    let seek = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::Player(PlayerCommand::SeekTo(_)))
    })
    .await;
    let SessionEvent::Player(PlayerCommand::SeekTo(position)) = seek else {
        unreachable!();
    };
    assert!((position - 30.0).abs() < 0.5, "seeked to {position}");
    synchronized(&mut bob_events).await;

    let state = bob.playback_state().await.unwrap();
    assert!(state.is_playing);
    assert_eq!(state.media_descriptor, movie());
    assert!((state.position_seconds - 30.0).abs() < 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_seek_then_pause_reaches_followers() {
    let room = TestRoom::new();
    let (alice, _alice_events) = room.join("alice").await;
    let (bob, mut bob_events) = room.join("bob").await;
    synchronized(&mut bob_events).await;

    alice.select_media(movie()).await.unwrap();
    alice.play(Some(0.0)).await.unwrap();
    room.clock.advance(5.0);
    alice.seek(120.0).await.unwrap();
    alice.pause().await.unwrap();

    wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::PlaybackStateChanged(s)
            if !s.is_playing && s.position_seconds == 120.0)
    })
    .await;

    room.clock.advance(10.0);
    let state = bob.playback_state().await.unwrap();
    assert!(!state.is_playing);
    assert_eq!(state.position_seconds, 120.0);
    assert_eq!(state.media_descriptor, movie());
}

#[tokio::test(start_paused = true)]
async fn test_host_leave_fails_over_to_earliest_joiner() {
    let room = TestRoom::new();
    let (alice, _alice_events) = room.join("alice").await;
    room.clock.advance(1.0);
    let (bob, mut bob_events) = room.join("bob").await;
    room.clock.advance(1.0);
    let (carol, mut carol_events) = room.join("carol").await;
    synchronized(&mut bob_events).await;
    synchronized(&mut carol_events).await;

    alice.select_media(movie()).await.unwrap();
    alice.play(Some(10.0)).await.unwrap();
    settle().await;
    alice.leave().await.unwrap();

    let promoted = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::HostChanged { .. })
    })
    .await;
    assert_eq!(
        promoted,
        SessionEvent::HostChanged {
            host_id: "bob".into(),
            is_local: true
        }
    );
    let changed = wait_for(&mut carol_events, |e| {
        matches!(e, SessionEvent::HostChanged { .. })
    })
    .await;
    assert_eq!(
        changed,
        SessionEvent::HostChanged {
            host_id: "bob".into(),
            is_local: false
        }
    );
    synchronized(&mut carol_events).await;

    assert!(bob.is_host().await.unwrap());
    let bob_state = bob.playback_state().await.unwrap();
    let carol_state = carol.playback_state().await.unwrap();
    assert!(bob_state.is_playing && carol_state.is_playing);
    assert_eq!(carol_state.media_descriptor, movie());
    assert!((bob_state.position_seconds - carol_state.position_seconds).abs() < 0.5);

    // The new host is in charge now
    bob.pause().await.unwrap();
    wait_for(&mut carol_events, |e| {
        matches!(e, SessionEvent::PlaybackStateChanged(s) if !s.is_playing)
    })
    .await;
    assert_eq!(carol.pause().await, Err(SessionError::NotHost));
}

#[tokio::test(start_paused = true)]
async fn test_host_drop_fails_over_to_earliest_joiner() {
    let room = TestRoom::new();
    let (host, _host_inbound) = room.raw_member("alice").await;
    let playing = PlaybackState {
        media_descriptor: movie(),
        is_playing: true,
        position_seconds: 10.0,
        last_updated: 1_000.0,
    };
    host.send(
        ClientFrame::PublishState {
            playback: playing.clone(),
        },
        Lane::Control,
    )
    .unwrap();
    settle().await;

    room.clock.advance(1.0);
    let (bob, mut bob_events) = room.join("bob").await;
    room.clock.advance(1.0);
    let (carol, mut carol_events) = room.join("carol").await;

    // Gone without a leave; the seat is held for the reconnect grace
    drop(host);

    wait_for(&mut bob_events, |e| {
        *e == SessionEvent::HostChanged {
            host_id: "bob".into(),
            is_local: true,
        }
    })
    .await;
    wait_for(&mut carol_events, |e| {
        *e == SessionEvent::HostChanged {
            host_id: "bob".into(),
            is_local: false,
        }
    })
    .await;
    synchronized(&mut carol_events).await;

    // Bob took over from the state alice last published
    let bob_state = bob.playback_state().await.unwrap();
    let carol_state = carol.playback_state().await.unwrap();
    assert!(bob.is_host().await.unwrap());
    assert_eq!(bob_state.media_descriptor, movie());
    assert!(bob_state.is_playing && carol_state.is_playing);
    assert_eq!(carol_state.media_descriptor, movie());
    assert!((bob_state.position_seconds - carol_state.position_seconds).abs() < 0.5);

    let trailer = MediaDescriptor::stream("trailer", "https://example.com/trailer.m3u8");
    bob.select_media(trailer.clone()).await.unwrap();
    wait_for(&mut carol_events, |e| {
        *e == SessionEvent::Player(PlayerCommand::Load(trailer.clone()))
    })
    .await;
    let roster = carol.participants().await.unwrap();
    assert_eq!(roster.len(), 2);
    assert!(roster.iter().all(|p| p.user_id != "alice"));
}

#[tokio::test(start_paused = true)]
async fn test_host_player_follows_its_own_actions() {
    let room = TestRoom::new();
    let (alice, mut alice_events) = room.join("alice").await;

    alice.select_media(movie()).await.unwrap();
    wait_for(&mut alice_events, |e| {
        *e == SessionEvent::Player(PlayerCommand::Load(movie()))
    })
    .await;

    alice.play(Some(3.0)).await.unwrap();
    wait_for(&mut alice_events, |e| {
        *e == SessionEvent::Player(PlayerCommand::SeekTo(3.0))
    })
    .await;
    wait_for(&mut alice_events, |e| {
        *e == SessionEvent::Player(PlayerCommand::Play)
    })
    .await;

    alice.seek(42.0).await.unwrap();
    wait_for(&mut alice_events, |e| {
        *e == SessionEvent::Player(PlayerCommand::SeekTo(42.0))
    })
    .await;

    alice.pause().await.unwrap();
    wait_for(&mut alice_events, |e| {
        *e == SessionEvent::Player(PlayerCommand::Pause)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_inconsistent_transfer_is_abandoned() {
    let room = TestRoom::new();
    let (host, _host_inbound) = room.raw_member("alice").await;
    let (_bob, mut bob_events) = room.join("bob").await;

    // Three bytes where 99 were declared
    let chunk = SignalMessage::Chunk(ChunkPayload {
        media_item_id: "clip".into(),
        sequence: 0,
        total_chunks: 1,
        total_size: Some(99),
        bytes_base64: "AAEC".into(),
    });
    let envelope = encode(&Envelope::new(ROOM, "alice", None, chunk)).unwrap();
    host.send(
        ClientFrame::Signal {
            to: Some("bob".into()),
            lane: Lane::Bulk,
            envelope,
        },
        Lane::Bulk,
    )
    .unwrap();

    let abandoned = wait_for(&mut bob_events, |e| {
        matches!(
            e,
            SessionEvent::TransferAbandoned { .. } | SessionEvent::TransferComplete { .. }
        )
    })
    .await;
    assert_eq!(
        abandoned,
        SessionEvent::TransferAbandoned {
            media_item_id: "clip".into(),
            source_id: "alice".into(),
            received: 1,
            total: 1,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_retries_give_up_after_four_attempts() {
    let room = TestRoom::new();

    // A host that never answers
    let (_host, mut host_inbound) = room.raw_member("alice").await;

    let (_bob, mut bob_events) = room.join("bob").await;
    let failed = wait_for(&mut bob_events, |e| matches!(e, SessionEvent::Error(_))).await;
    assert_eq!(
        failed,
        SessionEvent::Error(SessionError::NotSynchronized { attempts: 4 })
    );

    settle().await;
    let mut requests = 0;
    while let Ok(frame) = host_inbound.try_recv() {
        if let ServerFrame::Signal { envelope, .. } = frame {
            if decode(&envelope).unwrap().message == SignalMessage::StateSnapshotRequest {
                requests += 1;
            }
        }
    }
    assert_eq!(requests, 4);
}

#[tokio::test(start_paused = true)]
async fn test_shared_file_arrives_whole() {
    let room = TestRoom::new();
    let (alice, _alice_events) = room.join("alice").await;
    let (_bob, mut bob_events) = room.join("bob").await;
    synchronized(&mut bob_events).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let media_item_id = alice.share_file(None, payload.clone(), None).await.unwrap();

    let complete = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::TransferComplete { .. })
    })
    .await;
    let SessionEvent::TransferComplete {
        media_item_id: received_id,
        source_id,
        payload: received,
    } = complete
    else {
        unreachable!();
    };
    assert_eq!(received_id, media_item_id);
    assert_eq!(source_id, "alice");
    assert_eq!(*received, payload);
}

#[tokio::test(start_paused = true)]
async fn test_followers_cannot_drive_the_room() {
    let room = TestRoom::new();
    let (_alice, _alice_events) = room.join("alice").await;
    let (bob, mut bob_events) = room.join("bob").await;
    synchronized(&mut bob_events).await;

    assert_eq!(bob.play(None).await, Err(SessionError::NotHost));
    assert_eq!(bob.seek(10.0).await, Err(SessionError::NotHost));
    assert_eq!(bob.select_media(movie()).await, Err(SessionError::NotHost));
    assert_eq!(
        bob.share_file(None, vec![1, 2, 3], None).await,
        Err(SessionError::NotHost)
    );
    assert_eq!(bob.transfer_host("bob").await, Err(SessionError::NotHost));
}

#[tokio::test(start_paused = true)]
async fn test_transfer_host_swaps_roles() {
    let room = TestRoom::new();
    let (alice, mut alice_events) = room.join("alice").await;
    let (bob, mut bob_events) = room.join("bob").await;
    synchronized(&mut bob_events).await;

    assert_eq!(
        alice.transfer_host("mallory").await,
        Err(SessionError::UnknownParticipant("mallory".into()))
    );
    alice.select_media(movie()).await.unwrap();
    alice.transfer_host("bob").await.unwrap();

    wait_for(&mut bob_events, |e| {
        *e == SessionEvent::HostChanged {
            host_id: "bob".into(),
            is_local: true,
        }
    })
    .await;
    wait_for(&mut alice_events, |e| {
        *e == SessionEvent::HostChanged {
            host_id: "bob".into(),
            is_local: false,
        }
    })
    .await;
    synchronized(&mut alice_events).await;

    assert!(bob.is_host().await.unwrap());
    assert!(!alice.is_host().await.unwrap());
    assert_eq!(alice.play(None).await, Err(SessionError::NotHost));
    assert_eq!(alice.playback_state().await.unwrap().media_descriptor, movie());
}

#[tokio::test(start_paused = true)]
async fn test_drift_triggers_resync() {
    let room = TestRoom::new();
    let (alice, _alice_events) = room.join("alice").await;
    alice.select_media(movie()).await.unwrap();
    alice.play(Some(0.0)).await.unwrap();

    let (bob, mut bob_events) = room.join("bob").await;
    synchronized(&mut bob_events).await;
    bob.media_ready().unwrap();

    // Within the threshold
    bob.report_position(1.0).unwrap();
    settle().await;
    assert!(bob_events.try_recv().is_none());

    bob.report_position(500.0).unwrap();
    synchronized(&mut bob_events).await;
}

#[tokio::test(start_paused = true)]
async fn test_chat_reaches_the_room() {
    let room = TestRoom::new();
    let (alice, _alice_events) = room.join("alice").await;
    let (_bob, mut bob_events) = room.join("bob").await;

    alice.send_chat("popcorn?").unwrap();
    let chat = wait_for(&mut bob_events, |e| matches!(e, SessionEvent::Chat { .. })).await;
    assert_eq!(
        chat,
        SessionEvent::Chat {
            from: "alice".into(),
            text: "popcorn?".into(),
            sent_at: 1_000.0,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_leave_ends_the_session() {
    let room = TestRoom::new();
    let (alice, mut alice_events) = room.join("alice").await;
    let (_bob, mut bob_events) = room.join("bob").await;

    alice.leave().await.unwrap();
    wait_for(&mut alice_events, |e| *e == SessionEvent::Disconnected).await;
    assert_eq!(alice.play(None).await, Err(SessionError::NotInRoom));

    let roster = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::ParticipantsChanged(r) if r.len() == 1)
    })
    .await;
    let SessionEvent::ParticipantsChanged(roster) = roster else {
        unreachable!();
    };
    assert_eq!(roster[0].user_id, "bob");
    assert!(roster[0].is_host);
}

#[tokio::test(start_paused = true)]
async fn test_join_failures() {
    let room = TestRoom::new();

    let link = room.hub.connect_local(room.services.clone(), 8);
    let result = RoomSession::join(
        room.config(),
        link,
        JoinRequest::new(ROOM, "  ", "nobody"),
        Arc::new(NoopBackend),
    )
    .await;
    assert!(matches!(result, Err(SessionError::AuthFailure(_))));

    let rooms = Arc::new(StaticRoomService::new());
    rooms.add_room("OTHERROOM", &[]);
    let services = room.services.clone().with_rooms(rooms);
    let link = room.hub.connect_local(services, 8);
    let result = RoomSession::join(
        room.config(),
        link,
        JoinRequest::new(ROOM, "alice", "Alice"),
        Arc::new(NoopBackend),
    )
    .await;
    assert!(matches!(result, Err(SessionError::RoomNotFound(_))));

    // Nobody on the other end
    let (sender, _outbound) = lanes::<ClientFrame>(4);
    let (_inbound_tx, inbound) = mpsc::unbounded_channel::<ServerFrame>();
    let result = RoomSession::join(
        room.config().with_join_timeout(Duration::from_secs(5)),
        RelayLink { sender, inbound },
        JoinRequest::new(ROOM, "alice", "Alice"),
        Arc::new(NoopBackend),
    )
    .await;
    assert_eq!(result.err(), Some(SessionError::RoomNotFound(ROOM.into())));
}
