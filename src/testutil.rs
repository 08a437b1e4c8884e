//! Shared mocks for session and controller tests: a scripted peer connector
//! that completes negotiation once both descriptions are in place, and a
//! no-op media gateway that records sink attachments.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::MediaGateway;
use crate::connection::{LinkEvent, LinkEventSender, LinkState, PeerConnector, PeerLink};
use crate::error::{Error, Result};
use crate::signaling::{IceCandidateInit, ParticipantId, SdpKind, SessionDescription};

pub(crate) struct LinkShared {
    me: String,
    peer: ParticipantId,
    events: LinkEventSender,
    offers: AtomicUsize,
    answers: AtomicUsize,
    sent_offers: StdMutex<Vec<String>>,
    candidates: StdMutex<Vec<IceCandidateInit>>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    // Negotiation completes once; restarts stay pending until failed again.
    announced: AtomicBool,
    pub closed: AtomicBool,
}

impl LinkShared {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send((self.peer.clone(), event));
    }

    fn host_candidate(&self, seq: usize) -> IceCandidateInit {
        IceCandidateInit {
            candidate: format!(
                "candidate:{seq} 1 UDP 2122252543 203.0.113.{seq} 50000 typ host"
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some(self.me.clone()),
        }
    }

    fn maybe_connected(&self) {
        if self.local_set.load(Ordering::SeqCst)
            && self.remote_set.load(Ordering::SeqCst)
            && !self.announced.swap(true, Ordering::SeqCst)
        {
            self.emit(LinkEvent::StateChanged(LinkState::Connecting));
            self.emit(LinkEvent::StateChanged(LinkState::Connected));
        }
    }
}

struct MockLink {
    shared: Arc<LinkShared>,
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let n = self.shared.offers.fetch_add(1, Ordering::SeqCst) + 1;
        let suffix = if ice_restart { ":restart" } else { "" };
        let sdp = format!("offer:{}->{}#{n}{suffix}", self.shared.me, self.shared.peer);
        self.shared.sent_offers.lock().unwrap().push(sdp.clone());
        self.shared.local_set.store(true, Ordering::SeqCst);
        self.shared
            .emit(LinkEvent::LocalCandidate(self.shared.host_candidate(n)));
        self.shared.maybe_connected();
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if !self.shared.remote_set.load(Ordering::SeqCst) {
            return Err(Error::Transport("answer without remote description".into()));
        }
        let n = self.shared.answers.fetch_add(1, Ordering::SeqCst) + 1;
        let sdp = format!("answer:{}->{}#{n}", self.shared.me, self.shared.peer);
        self.shared.local_set.store(true, Ordering::SeqCst);
        self.shared
            .emit(LinkEvent::LocalCandidate(self.shared.host_candidate(n + 100)));
        self.shared.maybe_connected();
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<()> {
        self.shared.remote_set.store(true, Ordering::SeqCst);
        self.shared.maybe_connected();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.shared.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MockConnector {
    me: String,
    opened: AtomicUsize,
    links: StdMutex<HashMap<String, Arc<LinkShared>>>,
}

impl MockConnector {
    pub fn new(me: &str) -> Self {
        Self {
            me: me.to_string(),
            opened: AtomicUsize::new(0),
            links: StdMutex::new(HashMap::new()),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn total_offers(&self) -> usize {
        self.links
            .lock()
            .unwrap()
            .values()
            .map(|l| l.offers.load(Ordering::SeqCst))
            .sum()
    }

    pub fn total_answers(&self) -> usize {
        self.links
            .lock()
            .unwrap()
            .values()
            .map(|l| l.answers.load(Ordering::SeqCst))
            .sum()
    }

    pub fn candidates_for(&self, peer: &str) -> Vec<IceCandidateInit> {
        self.links
            .lock()
            .unwrap()
            .get(peer)
            .map(|l| l.candidates.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn last_offer_sdp(&self, peer: &str) -> Option<String> {
        self.links
            .lock()
            .unwrap()
            .get(peer)
            .and_then(|l| l.sent_offers.lock().unwrap().last().cloned())
    }

    /// Simulates an ICE failure on the link to `peer`. The link stays broken:
    /// renegotiation after the failure never reaches `Connected` again.
    pub fn fail_link(&self, peer: &str) {
        if let Some(link) = self.links.lock().unwrap().get(peer) {
            link.announced.store(true, Ordering::SeqCst);
            link.emit(LinkEvent::StateChanged(LinkState::Failed));
        }
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn open(
        &self,
        peer: &ParticipantId,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerLink>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(LinkShared {
            me: self.me.clone(),
            peer: peer.clone(),
            events,
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            sent_offers: StdMutex::new(Vec::new()),
            candidates: StdMutex::new(Vec::new()),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.links
            .lock()
            .unwrap()
            .insert(peer.as_str().to_string(), shared.clone());
        Ok(Box::new(MockLink { shared }))
    }
}

#[derive(Default)]
pub(crate) struct NullMedia {
    muted: AtomicBool,
    sinks: StdMutex<HashSet<ParticipantId>>,
}

impl NullMedia {
    pub fn attached(&self, peer: &ParticipantId) -> bool {
        self.sinks.lock().unwrap().contains(peer)
    }
}

#[async_trait]
impl MediaGateway for NullMedia {
    async fn acquire(&self) -> Result<()> {
        Ok(())
    }

    async fn release(&self) {}

    async fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn local_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        None
    }

    async fn attach_remote(&self, peer: &ParticipantId, _track: Arc<TrackRemote>) {
        self.sinks.lock().unwrap().insert(peer.clone());
    }

    async fn detach_remote(&self, peer: &ParticipantId) {
        self.sinks.lock().unwrap().remove(peer);
    }

    async fn user_interaction(&self) {}
}

/// Polls `cond` until it holds, panicking after two seconds.
pub(crate) async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if cond().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within two seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
