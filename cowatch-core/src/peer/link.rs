//! Per-remote link state

use super::backend::StreamHandle;
use crate::signaling::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Offering,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn can_become(self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (New, Offering | Answering) => true,
            (Offering | Answering, Connected) => true,
            // Re-offer from the initiator on an established link
            (Connected, Answering) => true,
            (New | Offering | Answering | Connected, Failed) => true,
            (Closed, _) => false,
            (_, Closed) => true,
            _ => false,
        }
    }

    /// Neither failed nor closed
    pub fn is_live(self) -> bool {
        !matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

/// A direct link to one remote participant
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub remote_id: String,
    pub state: LinkState,
    pub remote_description_set: bool,
    /// Candidates that arrived before the remote description, in order
    pub pending_candidates: Vec<IceCandidate>,
    pub streams: Vec<StreamHandle>,
}

impl PeerLink {
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            state: LinkState::New,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            streams: Vec::new(),
        }
    }

    /// Move to `next` if allowed. Returns false and leaves the state alone
    /// otherwise.
    pub fn advance(&mut self, next: LinkState) -> bool {
        if self.state == next {
            return true;
        }
        if self.state.can_become(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}
