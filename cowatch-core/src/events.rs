//! Session events
//!
//! A small typed event bus. Subscribers get their own queue and an explicit
//! handle; dropping the handle unsubscribes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::directory::Participant;
use crate::error::SessionError;
use crate::peer::StreamHandle;
use crate::signaling::VoiceStatePayload;
use crate::sync::{PlaybackState, PlayerCommand};

/// Everything a UI can observe about a room
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Admitted to the room
    Joined {
        room_id: String,
        user_id: String,
        is_host: bool,
    },
    PlaybackStateChanged(PlaybackState),
    /// Drive the local player. Sent on every playback change, including the
    /// host's own actions.
    Player(PlayerCommand),
    ParticipantsChanged(Vec<Participant>),
    HostChanged { host_id: String, is_local: bool },
    PeerConnected { remote_id: String },
    PeerStreamReceived {
        remote_id: String,
        stream: StreamHandle,
    },
    TransferComplete {
        media_item_id: String,
        source_id: String,
        payload: Arc<Vec<u8>>,
    },
    TransferAbandoned {
        media_item_id: String,
        source_id: String,
        received: u32,
        total: u32,
    },
    Chat {
        from: String,
        text: String,
        sent_at: f64,
    },
    VoiceChanged {
        user_id: String,
        in_voice: bool,
        state: VoiceStatePayload,
    },
    /// Local mirror matches the host again after a resync
    Synchronized,
    Error(SessionError),
    /// The session ended
    Disconnected,
}

struct Subscribers<E> {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<E>>,
}

/// Fan-out of events to any number of subscribers
pub struct EventBus<E> {
    inner: Arc<Mutex<Subscribers<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                senders: HashMap::new(),
            })),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.senders.insert(id, tx);
        Subscription {
            id,
            receiver: rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver to every live subscriber. Returns how many got it.
    pub fn emit(&self, event: E) -> usize {
        let mut inner = self.inner.lock();
        inner.senders.retain(|_, tx| tx.send(event.clone()).is_ok());
        inner.senders.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().senders.len()
    }
}

/// A subscriber's queue. Unsubscribes on drop.
pub struct Subscription<E> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<E>,
    bus: Weak<Mutex<Subscribers<E>>>,
}

impl<E> Subscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().senders.remove(&self.id);
        }
    }
}
