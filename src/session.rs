//! Full-mesh peer session for one room membership. Keeps exactly one
//! connection entry per other participant, negotiating offer/answer/ICE over
//! the signaling channel. All map mutation happens on one logical thread:
//! the driver task and `close` serialize on the session lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::MediaGateway;
use crate::connection::{LinkEvent, LinkEventSender, LinkState, PeerConnector, PeerLink, Role};
use crate::error::{Error, Result};
use crate::signaling::{
    IceCandidateInit, ParticipantEvent, ParticipantId, ParticipantRecord, SessionDescription,
    SignalPayload, SignalingChannel, SignalingMessage,
};

/// Updates pushed to the presentation layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RoomsChanged,
    ParticipantJoined(ParticipantRecord),
    ParticipantUpdated(ParticipantRecord),
    ParticipantLeft(ParticipantId),
    PeerStateChanged(ParticipantId, LinkState),
    /// Negotiation with this peer failed terminally; the rest of the mesh is
    /// unaffected.
    PeerUnreachable(ParticipantId),
    /// Own membership record disappeared (owner deleted the room).
    Evicted,
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

struct PeerEntry {
    link: Box<dyn PeerLink>,
    role: Role,
    state: LinkState,
    /// Candidates received before the remote description; flushed once it is set.
    pending_candidates: Vec<IceCandidateInit>,
    last_remote_sdp: Option<String>,
    restart_attempted: bool,
}

struct SessionState {
    room: String,
    me: ParticipantId,
    channel: Arc<dyn SignalingChannel>,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaGateway>,
    events: SessionEventSender,
    link_events: LinkEventSender,
    peers: HashMap<ParticipantId, PeerEntry>,
    /// Candidates that outran both the membership notification and the offer.
    early_candidates: HashMap<ParticipantId, Vec<IceCandidateInit>>,
    closed: bool,
}

pub struct PeerSessionManager {
    state: Arc<Mutex<SessionState>>,
    driver: JoinHandle<()>,
}

impl PeerSessionManager {
    pub async fn start(
        room: &str,
        me: ParticipantId,
        channel: Arc<dyn SignalingChannel>,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn MediaGateway>,
        events: SessionEventSender,
    ) -> Result<Self> {
        let mut participants = channel.watch_participants(room).await?;
        let mut signals = channel.watch_signals(room).await?;
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();

        let state = Arc::new(Mutex::new(SessionState {
            room: room.to_string(),
            me,
            channel,
            connector,
            media,
            events,
            link_events: link_tx,
            peers: HashMap::new(),
            early_candidates: HashMap::new(),
            closed: false,
        }));

        let driver_state = state.clone();
        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = participants.recv() => match event {
                        Some(event) => {
                            let mut s = driver_state.lock().await;
                            if let Err(e) = s.on_participant(event).await {
                                warn!(room = %s.room, %e, "participant event failed");
                            }
                        }
                        None => {
                            driver_state.lock().await.on_room_gone().await;
                            break;
                        }
                    },
                    message = signals.recv() => match message {
                        Some(message) => {
                            let mut s = driver_state.lock().await;
                            if let Err(e) = s.on_signal(message).await {
                                warn!(room = %s.room, %e, "signal handling failed");
                            }
                        }
                        None => {
                            driver_state.lock().await.on_room_gone().await;
                            break;
                        }
                    },
                    link = link_rx.recv() => match link {
                        Some((peer, event)) => {
                            let mut s = driver_state.lock().await;
                            if let Err(e) = s.on_link_event(&peer, event).await {
                                warn!(room = %s.room, %peer, %e, "link event failed");
                            }
                        }
                        // The state holds a sender, so this only happens on teardown.
                        None => break,
                    },
                }
            }
        });

        Ok(Self { state, driver })
    }

    /// Tears every connection down before returning; no signaling message
    /// observed afterwards can spawn a new one.
    pub async fn close(&self) {
        {
            let mut s = self.state.lock().await;
            if !s.closed {
                s.closed = true;
                s.teardown_all().await;
                info!(room = %s.room, "voice session closed");
            }
        }
        self.driver.abort();
    }

    pub async fn peer_states(&self) -> Vec<(ParticipantId, LinkState)> {
        let s = self.state.lock().await;
        s.peers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state))
            .collect()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

impl Drop for PeerSessionManager {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl SessionState {
    async fn on_participant(&mut self, event: ParticipantEvent) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        match event {
            ParticipantEvent::Added(record) => {
                let id = record.id.clone();
                self.emit(SessionEvent::ParticipantJoined(record));
                if id != self.me {
                    self.ensure_peer(&id).await?;
                }
            }
            ParticipantEvent::Updated(record) => {
                self.emit(SessionEvent::ParticipantUpdated(record));
            }
            ParticipantEvent::Removed(id) => {
                if id == self.me {
                    info!(room = %self.room, "own membership removed, leaving session");
                    self.closed = true;
                    self.teardown_all().await;
                    self.emit(SessionEvent::Evicted);
                } else {
                    self.teardown_peer(&id).await;
                    self.emit(SessionEvent::ParticipantLeft(id));
                }
            }
        }
        Ok(())
    }

    /// Desired-state reconciliation for one peer: a no-op when the entry
    /// already exists, so replayed membership events never duplicate
    /// connections or re-send offers.
    async fn ensure_peer(&mut self, peer: &ParticipantId) -> Result<()> {
        if self.peers.contains_key(peer) {
            return Ok(());
        }
        let role = Role::between(&self.me, peer);
        let link = self.connector.open(peer, self.link_events.clone()).await?;
        let mut entry = PeerEntry {
            link,
            role,
            state: LinkState::New,
            pending_candidates: self.early_candidates.remove(peer).unwrap_or_default(),
            last_remote_sdp: None,
            restart_attempted: false,
        };

        let offer = if role == Role::Initiator {
            Some(entry.link.create_offer(false).await.map_err(|e| negotiation(peer, e))?)
        } else {
            debug!(%peer, "waiting for offer");
            None
        };
        self.peers.insert(peer.clone(), entry);
        if let Some(sdp) = offer {
            debug!(%peer, "sending offer");
            self.publish(peer, SignalPayload::Offer { sdp }).await?;
        }
        Ok(())
    }

    async fn on_signal(&mut self, message: SignalingMessage) -> Result<()> {
        if self.closed || !message.addressed_to(&self.me) {
            return Ok(());
        }
        let peer = message.sender.clone();
        debug!(%peer, kind = message.payload.kind(), "signal received");
        match message.payload {
            SignalPayload::Offer { sdp } => self.on_offer(&peer, sdp).await,
            SignalPayload::Answer { sdp } => self.on_answer(&peer, sdp).await,
            SignalPayload::IceCandidate { candidate } => self.on_candidate(&peer, candidate).await,
        }
    }

    async fn on_offer(&mut self, peer: &ParticipantId, sdp: SessionDescription) -> Result<()> {
        if !self.peers.contains_key(peer) {
            // The offer can outrun the membership notification.
            self.ensure_peer(peer).await?;
        }
        let answer = {
            let Some(entry) = self.peers.get_mut(peer) else {
                return Ok(());
            };
            if entry.role == Role::Initiator {
                warn!(%peer, "dropping offer from the responder side");
                return Ok(());
            }
            if entry.last_remote_sdp.as_deref() == Some(sdp.sdp.as_str()) {
                debug!(%peer, "duplicate offer ignored");
                return Ok(());
            }
            entry
                .link
                .set_remote_description(sdp.clone())
                .await
                .map_err(|e| negotiation(peer, e))?;
            entry.last_remote_sdp = Some(sdp.sdp);
            flush_candidates(entry, peer).await;
            entry
                .link
                .create_answer()
                .await
                .map_err(|e| negotiation(peer, e))?
        };
        debug!(%peer, "sending answer");
        self.publish(peer, SignalPayload::Answer { sdp: answer }).await
    }

    async fn on_answer(&mut self, peer: &ParticipantId, sdp: SessionDescription) -> Result<()> {
        let Some(entry) = self.peers.get_mut(peer) else {
            debug!(%peer, "answer without a connection entry, ignoring");
            return Ok(());
        };
        if entry.role == Role::Responder {
            warn!(%peer, "dropping answer on the responder side");
            return Ok(());
        }
        if entry.last_remote_sdp.as_deref() == Some(sdp.sdp.as_str()) {
            debug!(%peer, "duplicate answer ignored");
            return Ok(());
        }
        entry
            .link
            .set_remote_description(sdp.clone())
            .await
            .map_err(|e| negotiation(peer, e))?;
        entry.last_remote_sdp = Some(sdp.sdp);
        flush_candidates(entry, peer).await;
        Ok(())
    }

    async fn on_candidate(&mut self, peer: &ParticipantId, candidate: IceCandidateInit) -> Result<()> {
        match self.peers.get_mut(peer) {
            None => {
                // No entry yet: park until the membership event arrives.
                self.early_candidates
                    .entry(peer.clone())
                    .or_default()
                    .push(candidate);
            }
            Some(entry) if entry.last_remote_sdp.is_none() => {
                entry.pending_candidates.push(candidate);
            }
            Some(entry) => {
                // Duplicates and replays must not fail the session.
                if let Err(e) = entry.link.add_remote_candidate(candidate).await {
                    debug!(%peer, %e, "remote candidate rejected");
                }
            }
        }
        Ok(())
    }

    async fn on_link_event(&mut self, peer: &ParticipantId, event: LinkEvent) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if self.peers.contains_key(peer) {
                    self.publish(peer, SignalPayload::IceCandidate { candidate })
                        .await?;
                }
            }
            LinkEvent::StateChanged(state) => {
                let follow_up = {
                    let Some(entry) = self.peers.get_mut(peer) else {
                        return Ok(());
                    };
                    entry.state = state;
                    match state {
                        LinkState::Connected => {
                            // A future failure earns a fresh restart attempt.
                            entry.restart_attempted = false;
                            FollowUp::None
                        }
                        LinkState::Failed if !entry.restart_attempted => {
                            entry.restart_attempted = true;
                            if entry.role == Role::Initiator {
                                FollowUp::Restart
                            } else {
                                // The initiator re-offers; we answer it.
                                FollowUp::None
                            }
                        }
                        LinkState::Failed => FollowUp::Teardown,
                        _ => FollowUp::None,
                    }
                };
                self.emit(SessionEvent::PeerStateChanged(peer.clone(), state));
                match follow_up {
                    FollowUp::None => {}
                    FollowUp::Restart => {
                        info!(%peer, "attempting ice restart");
                        let offer = {
                            let entry = self.peers.get_mut(peer).ok_or(Error::Closed)?;
                            entry.link.create_offer(true).await
                        };
                        match offer {
                            Ok(sdp) => {
                                self.publish(peer, SignalPayload::Offer { sdp }).await?
                            }
                            Err(e) => {
                                warn!(%peer, %e, "ice restart failed");
                                self.teardown_peer(peer).await;
                                self.emit(SessionEvent::PeerUnreachable(peer.clone()));
                            }
                        }
                    }
                    FollowUp::Teardown => {
                        warn!(%peer, "negotiation failed after restart, removing peer");
                        self.teardown_peer(peer).await;
                        self.emit(SessionEvent::PeerUnreachable(peer.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_room_gone(&mut self) {
        if !self.closed {
            info!(room = %self.room, "room disappeared, closing session");
            self.closed = true;
            self.teardown_all().await;
            self.emit(SessionEvent::Evicted);
        }
    }

    async fn teardown_peer(&mut self, peer: &ParticipantId) {
        if let Some(entry) = self.peers.remove(peer) {
            if let Err(e) = entry.link.close().await {
                debug!(%peer, %e, "link close failed");
            }
        }
        self.early_candidates.remove(peer);
        self.media.detach_remote(peer).await;
    }

    async fn teardown_all(&mut self) {
        let peers: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.teardown_peer(&peer).await;
        }
        self.early_candidates.clear();
    }

    async fn publish(&self, peer: &ParticipantId, payload: SignalPayload) -> Result<()> {
        self.channel
            .publish_signal(
                &self.room,
                SignalingMessage::unicast(self.me.clone(), peer.clone(), payload),
            )
            .await
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

enum FollowUp {
    None,
    Restart,
    Teardown,
}

async fn flush_candidates(entry: &mut PeerEntry, peer: &ParticipantId) {
    for candidate in std::mem::take(&mut entry.pending_candidates) {
        if let Err(e) = entry.link.add_remote_candidate(candidate).await {
            debug!(%peer, %e, "buffered candidate rejected");
        }
    }
}

fn negotiation(peer: &ParticipantId, e: Error) -> Error {
    Error::Negotiation {
        peer: peer.to_string(),
        reason: e.to_string(),
    }
}
