//! Peer Connection Manager
//!
//! Owns every direct link of the local participant. The host initiates to
//! followers; followers only answer. Signals for links that do not exist are
//! stale and dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backend::{BackendError, MediaBackend, PeerEvent, SdpKind, StreamHandle, TrackHandle};
use super::link::{LinkState, PeerLink};
use crate::signaling::{IceCandidate, SessionDescription, SignalMessage};

/// Default window in which a second failure gives up on a remote
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("stale {kind} from {remote_id}")]
    StaleSignal {
        remote_id: String,
        kind: &'static str,
    },

    #[error("{0} is unreachable")]
    Unreachable(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Things the session has to act on
#[derive(Debug, Clone, PartialEq)]
pub enum PeerOutput {
    /// Send to `to` through the relay
    Signal { to: String, message: SignalMessage },
    Connected { remote_id: String },
    StreamReceived {
        remote_id: String,
        stream: StreamHandle,
    },
    /// Gave up on this remote for the rest of the session
    Unreachable { remote_id: String },
}

pub struct PeerManager {
    initiator: bool,
    backend: Arc<dyn MediaBackend>,
    links: HashMap<String, PeerLink>,
    roster: HashSet<String>,
    /// Time of the last failure per remote
    failures: HashMap<String, Instant>,
    unreachable: HashSet<String>,
    outbound_video: Option<TrackHandle>,
    failure_window: Duration,
}

impl PeerManager {
    pub fn new(backend: Arc<dyn MediaBackend>, initiator: bool) -> Self {
        Self {
            initiator,
            backend,
            links: HashMap::new(),
            roster: HashSet::new(),
            failures: HashMap::new(),
            unreachable: HashSet::new(),
            outbound_video: None,
            failure_window: DEFAULT_FAILURE_WINDOW,
        }
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// The host initiates; everyone else answers
    pub fn set_initiator(&mut self, initiator: bool) {
        if self.initiator != initiator {
            debug!("Peer initiator role: {}", initiator);
            self.initiator = initiator;
        }
    }

    pub fn link(&self, remote_id: &str) -> Option<&PeerLink> {
        self.links.get(remote_id)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn is_unreachable(&self, remote_id: &str) -> bool {
        self.unreachable.contains(remote_id)
    }

    pub fn outbound_video(&self) -> Option<&TrackHandle> {
        self.outbound_video.as_ref()
    }

    /// Create a link to `remote_id` if there is no live one. Starts an offer
    /// when we are the initiator. Returns true if a link was created.
    pub fn ensure_link_to(&mut self, remote_id: &str) -> Result<bool, PeerError> {
        if self.unreachable.contains(remote_id) {
            return Err(PeerError::Unreachable(remote_id.to_string()));
        }
        if self.links.get(remote_id).is_some_and(|l| l.state.is_live()) {
            return Ok(false);
        }

        self.backend.create_link(remote_id)?;
        let mut link = PeerLink::new(remote_id);
        if let Some(track) = &self.outbound_video {
            self.backend.attach_video_track(remote_id, Some(track))?;
        }
        if self.initiator {
            self.backend.create_offer(remote_id)?;
            link.advance(LinkState::Offering);
        }
        debug!("Link to {} created ({:?})", remote_id, link.state);
        self.links.insert(remote_id.to_string(), link);
        Ok(true)
    }

    /// Dispatch a negotiation message received from `from`
    pub fn handle_signal(&mut self, from: &str, message: &SignalMessage) -> Result<(), PeerError> {
        match message {
            SignalMessage::Offer(desc) => self.on_inbound_offer(from, &desc.sdp),
            SignalMessage::Answer(desc) => self.on_inbound_answer(from, &desc.sdp),
            SignalMessage::IceCandidate(candidate) => {
                self.on_inbound_candidate(from, candidate.clone())
            }
            _ => Ok(()),
        }
    }

    pub fn on_inbound_offer(&mut self, remote_id: &str, sdp: &str) -> Result<(), PeerError> {
        if self.unreachable.contains(remote_id) {
            return Err(PeerError::Unreachable(remote_id.to_string()));
        }
        if self.initiator {
            // Followers never initiate
            return Err(PeerError::StaleSignal {
                remote_id: remote_id.to_string(),
                kind: "offer",
            });
        }

        let live = self.links.get(remote_id).is_some_and(|l| l.state.is_live());
        if !live {
            self.backend.create_link(remote_id)?;
            self.links
                .insert(remote_id.to_string(), PeerLink::new(remote_id));
        }
        self.backend.accept_offer(remote_id, sdp)?;

        let Some(link) = self.links.get_mut(remote_id) else {
            return Ok(());
        };
        link.advance(LinkState::Answering);
        link.remote_description_set = true;
        let pending = std::mem::take(&mut link.pending_candidates);
        self.apply_candidates(remote_id, pending)
    }

    pub fn on_inbound_answer(&mut self, remote_id: &str, sdp: &str) -> Result<(), PeerError> {
        let offering = self
            .links
            .get(remote_id)
            .is_some_and(|l| l.state == LinkState::Offering && !l.remote_description_set);
        if !offering {
            return Err(PeerError::StaleSignal {
                remote_id: remote_id.to_string(),
                kind: "answer",
            });
        }
        self.backend.accept_answer(remote_id, sdp)?;

        let Some(link) = self.links.get_mut(remote_id) else {
            return Ok(());
        };
        link.remote_description_set = true;
        let pending = std::mem::take(&mut link.pending_candidates);
        self.apply_candidates(remote_id, pending)
    }

    pub fn on_inbound_candidate(
        &mut self,
        remote_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), PeerError> {
        let Some(link) = self.links.get_mut(remote_id).filter(|l| l.state.is_live()) else {
            return Err(PeerError::StaleSignal {
                remote_id: remote_id.to_string(),
                kind: "ice-candidate",
            });
        };
        if link.remote_description_set {
            self.backend.add_remote_candidate(remote_id, &candidate)?;
        } else {
            link.pending_candidates.push(candidate);
        }
        Ok(())
    }

    fn apply_candidates(
        &self,
        remote_id: &str,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), PeerError> {
        for candidate in &candidates {
            self.backend.add_remote_candidate(remote_id, candidate)?;
        }
        Ok(())
    }

    /// Feed a backend event back in
    pub fn handle_event(&mut self, event: PeerEvent, now: Instant) -> Vec<PeerOutput> {
        let remote_id = event.remote_id().to_string();
        let Some(link) = self.links.get_mut(&remote_id) else {
            debug!("Dropping peer event for unknown link {}", remote_id);
            return Vec::new();
        };

        match event {
            PeerEvent::LocalDescription { kind, sdp, .. } => {
                let desc = SessionDescription { sdp };
                let message = match kind {
                    SdpKind::Offer => SignalMessage::Offer(desc),
                    SdpKind::Answer => SignalMessage::Answer(desc),
                };
                vec![PeerOutput::Signal {
                    to: remote_id,
                    message,
                }]
            }
            PeerEvent::LocalCandidate { candidate, .. } => vec![PeerOutput::Signal {
                to: remote_id,
                message: SignalMessage::IceCandidate(candidate),
            }],
            PeerEvent::Connected { .. } => {
                if !link.advance(LinkState::Connected) {
                    warn!("Link to {} connected from {:?}", remote_id, link.state);
                    link.state = LinkState::Connected;
                }
                self.failures.remove(&remote_id);
                info!("Direct link to {} connected", remote_id);
                vec![PeerOutput::Connected { remote_id }]
            }
            PeerEvent::RemoteTrack { stream, .. } => {
                link.streams.push(stream.clone());
                vec![PeerOutput::StreamReceived { remote_id, stream }]
            }
            PeerEvent::Failed { reason, .. } => {
                warn!("Link to {} failed: {}", remote_id, reason);
                link.advance(LinkState::Failed);
                self.on_failure(&remote_id, now)
            }
            PeerEvent::Closed { .. } => {
                link.advance(LinkState::Closed);
                self.links.remove(&remote_id);
                Vec::new()
            }
        }
    }

    /// Drop the failed link, then retry once or give up
    fn on_failure(&mut self, remote_id: &str, now: Instant) -> Vec<PeerOutput> {
        self.teardown(remote_id);

        let recent = self
            .failures
            .get(remote_id)
            .is_some_and(|at| now.duration_since(*at) < self.failure_window);
        if recent {
            info!("Giving up on {} after repeated failures", remote_id);
            self.failures.remove(remote_id);
            self.unreachable.insert(remote_id.to_string());
            return vec![PeerOutput::Unreachable {
                remote_id: remote_id.to_string(),
            }];
        }
        self.failures.insert(remote_id.to_string(), now);

        if self.roster.contains(remote_id) {
            if let Err(e) = self.ensure_link_to(remote_id) {
                warn!("Retry to {} failed: {}", remote_id, e);
            }
        }
        Vec::new()
    }

    /// Track the room roster; links to departed remotes are torn down.
    /// Returns the ids that were torn down.
    pub fn update_roster<I, S>(&mut self, remote_ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roster = remote_ids.into_iter().map(Into::into).collect();
        let departed: Vec<String> = self
            .links
            .keys()
            .filter(|id| !self.roster.contains(*id))
            .cloned()
            .collect();
        for id in &departed {
            self.teardown(id);
        }
        let roster = &self.roster;
        self.failures.retain(|id, _| roster.contains(id));
        self.unreachable.retain(|id| roster.contains(id));
        departed
    }

    /// Swap the outbound video on every connected link. Links created later
    /// pick it up too. Returns the number of links updated.
    pub fn replace_outbound_video_track(
        &mut self,
        track: Option<TrackHandle>,
    ) -> Result<usize, PeerError> {
        self.outbound_video = track;
        let mut updated = 0;
        for (remote_id, link) in &self.links {
            if link.state == LinkState::Connected {
                self.backend
                    .attach_video_track(remote_id, self.outbound_video.as_ref())?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Close the link to `remote_id`, if any
    pub fn teardown(&mut self, remote_id: &str) {
        if let Some(mut link) = self.links.remove(remote_id) {
            link.advance(LinkState::Closed);
            self.backend.close(remote_id);
            debug!("Link to {} closed", remote_id);
        }
    }

    pub fn teardown_all(&mut self) {
        let ids: Vec<String> = self.links.keys().cloned().collect();
        for id in ids {
            self.teardown(&id);
        }
        self.failures.clear();
    }

    /// Whether `content_id` is already flowing over a connected link
    pub fn has_flowing_media(&self, content_id: &str) -> bool {
        let outbound = self
            .outbound_video
            .as_ref()
            .and_then(|t| t.content_id.as_deref())
            == Some(content_id);
        outbound && self.links.values().any(|l| l.state == LinkState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingBackend {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn record(&self, call: String) -> Result<(), BackendError> {
            self.calls.lock().push(call);
            Ok(())
        }
    }

    impl MediaBackend for RecordingBackend {
        fn create_link(&self, remote_id: &str) -> Result<(), BackendError> {
            self.record(format!("create_link {remote_id}"))
        }
        fn create_offer(&self, remote_id: &str) -> Result<(), BackendError> {
            self.record(format!("create_offer {remote_id}"))
        }
        fn accept_offer(&self, remote_id: &str, sdp: &str) -> Result<(), BackendError> {
            self.record(format!("accept_offer {remote_id} {sdp}"))
        }
        fn accept_answer(&self, remote_id: &str, sdp: &str) -> Result<(), BackendError> {
            self.record(format!("accept_answer {remote_id} {sdp}"))
        }
        fn add_remote_candidate(
            &self,
            remote_id: &str,
            candidate: &IceCandidate,
        ) -> Result<(), BackendError> {
            self.record(format!("candidate {remote_id} {}", candidate.candidate))
        }
        fn attach_video_track(
            &self,
            remote_id: &str,
            track: Option<&TrackHandle>,
        ) -> Result<(), BackendError> {
            let id = track.map(|t| t.track_id.as_str()).unwrap_or("-");
            self.record(format!("attach {remote_id} {id}"))
        }
        fn close(&self, remote_id: &str) {
            let _ = self.record(format!("close {remote_id}"));
        }
    }

    fn host() -> (Arc<RecordingBackend>, PeerManager) {
        let backend = Arc::new(RecordingBackend::default());
        let mut manager = PeerManager::new(backend.clone(), true);
        manager.update_roster(["bob", "carol"]);
        (backend, manager)
    }

    fn follower() -> (Arc<RecordingBackend>, PeerManager) {
        let backend = Arc::new(RecordingBackend::default());
        let mut manager = PeerManager::new(backend.clone(), false);
        manager.update_roster(["alice"]);
        (backend, manager)
    }

    #[test]
    fn test_ensure_link_is_idempotent() {
        let (backend, mut host) = host();
        assert!(host.ensure_link_to("bob").unwrap());
        assert!(!host.ensure_link_to("bob").unwrap());
        assert_eq!(host.link_count(), 1);
        assert_eq!(backend.count("create_offer"), 1);
        assert_eq!(host.link("bob").unwrap().state, LinkState::Offering);
    }

    #[test]
    fn test_follower_never_initiates() {
        let (backend, mut follower) = follower();
        follower.ensure_link_to("alice").unwrap();
        assert_eq!(backend.count("create_offer"), 0);
        assert_eq!(follower.link("alice").unwrap().state, LinkState::New);
    }

    #[test]
    fn test_answer_without_offer_is_stale() {
        let (backend, mut host) = host();
        let err = host.on_inbound_answer("bob", "v=0").unwrap_err();
        assert!(matches!(err, PeerError::StaleSignal { kind: "answer", .. }));
        assert!(matches!(
            host.on_inbound_candidate("bob", IceCandidate::new("c1")),
            Err(PeerError::StaleSignal { .. })
        ));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_candidates_buffer_until_description() {
        let (backend, mut follower) = follower();
        follower.ensure_link_to("alice").unwrap();
        follower.on_inbound_candidate("alice", IceCandidate::new("c1")).unwrap();
        follower.on_inbound_candidate("alice", IceCandidate::new("c2")).unwrap();
        assert_eq!(backend.count("candidate"), 0);

        follower.on_inbound_offer("alice", "offer-sdp").unwrap();
        follower.on_inbound_candidate("alice", IceCandidate::new("c3")).unwrap();
        let calls = backend.calls();
        let tail: Vec<&str> = calls.iter().rev().take(4).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "accept_offer alice offer-sdp",
                "candidate alice c1",
                "candidate alice c2",
                "candidate alice c3",
            ]
        );
        assert_eq!(follower.link("alice").unwrap().state, LinkState::Answering);
    }

    #[test]
    fn test_negotiation_outputs() {
        let (_, mut host) = host();
        let now = Instant::now();
        host.ensure_link_to("bob").unwrap();
        let out = host.handle_event(
            PeerEvent::LocalDescription {
                remote_id: "bob".into(),
                kind: SdpKind::Offer,
                sdp: "o".into(),
            },
            now,
        );
        assert_eq!(
            out,
            vec![PeerOutput::Signal {
                to: "bob".into(),
                message: SignalMessage::Offer(SessionDescription { sdp: "o".into() })
            }]
        );

        host.on_inbound_answer("bob", "a").unwrap();
        let out = host.handle_event(PeerEvent::Connected { remote_id: "bob".into() }, now);
        assert_eq!(out, vec![PeerOutput::Connected { remote_id: "bob".into() }]);
        // A second answer for the same negotiation is stale
        assert!(host.on_inbound_answer("bob", "a").is_err());
    }

    #[test]
    fn test_retry_once_then_unreachable() {
        let (backend, mut host) = host();
        let start = Instant::now();
        host.ensure_link_to("bob").unwrap();

        let failed = || PeerEvent::Failed {
            remote_id: "bob".into(),
            reason: "ice".into(),
        };
        assert!(host.handle_event(failed(), start).is_empty());
        // Retried
        assert_eq!(backend.count("create_offer"), 2);
        assert_eq!(host.link("bob").unwrap().state, LinkState::Offering);

        let out = host.handle_event(failed(), start + Duration::from_secs(5));
        assert_eq!(out, vec![PeerOutput::Unreachable { remote_id: "bob".into() }]);
        assert!(host.link("bob").is_none());
        assert!(matches!(
            host.ensure_link_to("bob"),
            Err(PeerError::Unreachable(_))
        ));
    }

    #[test]
    fn test_failures_outside_window_retry_again() {
        let (backend, mut host) = host();
        let start = Instant::now();
        host.ensure_link_to("bob").unwrap();
        let failed = || PeerEvent::Failed {
            remote_id: "bob".into(),
            reason: "ice".into(),
        };
        host.handle_event(failed(), start);
        let out = host.handle_event(failed(), start + Duration::from_secs(31));
        assert!(out.is_empty());
        assert_eq!(backend.count("create_offer"), 3);
    }

    #[test]
    fn test_replace_track_and_roster_teardown() {
        let (backend, mut host) = host();
        let now = Instant::now();
        host.ensure_link_to("bob").unwrap();
        host.ensure_link_to("carol").unwrap();
        host.handle_event(PeerEvent::Connected { remote_id: "bob".into() }, now);

        let track = TrackHandle::video("screen-1", Some("movie-1".into()));
        assert_eq!(host.replace_outbound_video_track(Some(track)).unwrap(), 1);
        assert!(backend.calls().contains(&"attach bob screen-1".to_string()));
        assert!(host.has_flowing_media("movie-1"));
        assert!(!host.has_flowing_media("other"));

        let gone = host.update_roster(["carol"]);
        assert_eq!(gone, vec!["bob".to_string()]);
        assert_eq!(host.link_count(), 1);
        assert!(!host.has_flowing_media("movie-1"));

        host.teardown_all();
        host.teardown_all();
        assert_eq!(host.link_count(), 0);
        assert_eq!(backend.count("close"), 2);
    }
}
