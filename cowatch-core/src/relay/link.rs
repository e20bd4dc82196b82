//! Client side of the relay
//!
//! A `RelayLink` is a lane sender for outbound frames plus a receiver of
//! inbound frames, connected either over WebSocket or straight to an
//! in-process hub.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::frame::{ClientFrame, RelayError, ServerFrame};
use super::hub::RelayHub;
use super::lanes::{lanes, LaneSender};
use super::serve::{serve_member, RelayServices};

pub type RelaySender = LaneSender<ClientFrame>;

/// A connection to a relay
pub struct RelayLink {
    pub sender: RelaySender,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

impl RelayLink {
    pub fn split(self) -> (RelaySender, mpsc::UnboundedReceiver<ServerFrame>) {
        (self.sender, self.inbound)
    }
}

/// Connect to a relay over WebSocket
pub async fn connect(url: &str, bulk_depth: usize) -> Result<RelayLink, RelayError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    info!("Connected to relay at {}", url);
    let (mut sink, mut stream) = ws.split();

    let (sender, mut outbound) = lanes::<ClientFrame>(bulk_depth);
    let (inbound_tx, inbound) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some((frame, _)) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::text(text)).await {
                debug!("Relay write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Relay read failed: {}", e);
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            if !msg.is_text() {
                continue;
            }
            let frame = match msg.to_text().map(serde_json::from_str::<ServerFrame>) {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    warn!("Ignoring undecodable relay frame: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("Ignoring non-UTF-8 relay frame: {}", e);
                    continue;
                }
            };
            if inbound_tx.send(frame).is_err() {
                break;
            }
        }
        debug!("Relay connection closed");
    });

    Ok(RelayLink { sender, inbound })
}

impl RelayHub {
    /// Connect to this hub without a network in between
    pub fn connect_local(self: &Arc<Self>, services: RelayServices, bulk_depth: usize) -> RelayLink {
        let (sender, mut outbound) = lanes::<ClientFrame>(bulk_depth);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (member_tx, mut member_rx) = lanes::<ServerFrame>(bulk_depth);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some((frame, _)) = outbound.recv().await {
                if frames_tx.send(frame).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(serve_member(self.clone(), services, frames_rx, member_tx));
        tokio::spawn(async move {
            while let Some((frame, _)) = member_rx.recv().await {
                if inbound_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        RelayLink { sender, inbound }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{InsecureTokenVerifier, StaticRoomService};
    use crate::relay::{Lane, RelayErrorKind};

    fn join(room: &str, token: &str) -> ClientFrame {
        ClientFrame::Join {
            room_id: room.into(),
            token: token.into(),
            display_name: String::new(),
            avatar: None,
        }
    }

    #[tokio::test]
    async fn test_local_link_round_trip() {
        let hub = Arc::new(RelayHub::new());
        let services = RelayServices::new(Arc::new(InsecureTokenVerifier));
        let (alice_tx, mut alice_rx) = hub.connect_local(services.clone(), 8).split();
        let (bob_tx, mut bob_rx) = hub.connect_local(services, 8).split();

        alice_tx.send(join("ROOM", "alice"), Lane::Control).unwrap();
        assert!(matches!(alice_rx.recv().await, Some(ServerFrame::Joined { .. })));
        bob_tx.send(join("ROOM", "bob"), Lane::Control).unwrap();
        match bob_rx.recv().await {
            Some(ServerFrame::Joined { roster, .. }) => {
                // Display name falls back to the user id
                assert_eq!(roster[1].display_name, "bob");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        bob_tx
            .send(
                ClientFrame::Signal {
                    to: Some("alice".into()),
                    lane: Lane::Control,
                    envelope: "hi".into(),
                },
                Lane::Control,
            )
            .unwrap();
        assert!(matches!(alice_rx.recv().await, Some(ServerFrame::Roster { .. })));
        assert_eq!(
            alice_rx.recv().await,
            Some(ServerFrame::Signal {
                from: "bob".into(),
                envelope: "hi".into()
            })
        );
    }

    #[tokio::test]
    async fn test_join_rejections() {
        let hub = Arc::new(RelayHub::new());
        let rooms = Arc::new(StaticRoomService::new());
        rooms.add_room("MOVIE", &["alice"]);
        let services =
            RelayServices::new(Arc::new(InsecureTokenVerifier)).with_rooms(rooms);

        for (room, token, expected) in [
            ("MOVIE", "", RelayErrorKind::AuthFailure),
            ("NOPE", "alice", RelayErrorKind::RoomNotFound),
            ("MOVIE", "mallory", RelayErrorKind::AuthFailure),
        ] {
            let (tx, mut rx) = hub.connect_local(services.clone(), 8).split();
            tx.send(join(room, token), Lane::Control).unwrap();
            match rx.recv().await {
                Some(ServerFrame::Error { kind, .. }) => assert_eq!(kind, expected),
                other => panic!("unexpected frame: {other:?}"),
            }
            // Connection is closed after a refused join
            assert_eq!(rx.recv().await, None);
        }
    }

    #[tokio::test]
    async fn test_replaced_connection_stops_relaying() {
        let hub = Arc::new(RelayHub::new());
        let services = RelayServices::new(Arc::new(InsecureTokenVerifier));
        let (old_tx, mut old_rx) = hub.connect_local(services.clone(), 8).split();
        let (new_tx, mut new_rx) = hub.connect_local(services.clone(), 8).split();
        let (bob_tx, mut bob_rx) = hub.connect_local(services, 8).split();

        old_tx.send(join("ROOM", "alice"), Lane::Control).unwrap();
        assert!(matches!(old_rx.recv().await, Some(ServerFrame::Joined { .. })));
        new_tx.send(join("ROOM", "alice"), Lane::Control).unwrap();
        assert!(matches!(new_rx.recv().await, Some(ServerFrame::Joined { .. })));
        bob_tx.send(join("ROOM", "bob"), Lane::Control).unwrap();
        assert!(matches!(bob_rx.recv().await, Some(ServerFrame::Joined { .. })));

        let signal = |envelope: &str| ClientFrame::Signal {
            to: None,
            lane: Lane::Control,
            envelope: envelope.into(),
        };
        old_tx.send(signal("stale"), Lane::Control).unwrap();
        // The old connection is closed instead of served
        while let Some(frame) = old_rx.recv().await {
            assert!(!matches!(frame, ServerFrame::Signal { .. }), "{frame:?}");
        }

        new_tx.send(signal("fresh"), Lane::Control).unwrap();
        assert_eq!(
            bob_rx.recv().await,
            Some(ServerFrame::Signal {
                from: "alice".into(),
                envelope: "fresh".into()
            })
        );
        assert_eq!(hub.roster("ROOM").map(|r| r.len()), Some(2));
    }

    #[tokio::test]
    async fn test_signal_before_join() {
        let hub = Arc::new(RelayHub::new());
        let services = RelayServices::new(Arc::new(InsecureTokenVerifier));
        let (tx, mut rx) = hub.connect_local(services, 8).split();
        tx.send(ClientFrame::Leave, Lane::Control).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ServerFrame::Error {
                kind: RelayErrorKind::NotJoined,
                ..
            })
        ));
    }
}
