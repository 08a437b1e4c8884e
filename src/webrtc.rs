//! Peer links backed by the `webrtc` crate. Each link gets its own API
//! instance so codec registration and interceptors never leak between peers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::audio::MediaGateway;
use crate::config::SessionConfig;
use crate::connection::{LinkEvent, LinkEventSender, LinkState, PeerConnector, PeerLink};
use crate::error::{Error, Result};
use crate::signaling::{IceCandidateInit, ParticipantId, SdpKind, SessionDescription};

pub struct RtcPeerConnector {
    config: SessionConfig,
    media: Arc<dyn MediaGateway>,
}

impl RtcPeerConnector {
    pub fn new(config: SessionConfig, media: Arc<dyn MediaGateway>) -> Self {
        Self { config, media }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_candidate_pool_size: self.config.ice_candidate_pool_size,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn open(
        &self,
        peer: &ParticipantId,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerLink>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(self.rtc_configuration()).await?);

        if let Some(track) = self.media.local_track() {
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // Drain RTCP so the interceptor chain keeps running.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender.read(&mut buf).await {}
            });
        }

        let candidate_events = events.clone();
        let candidate_peer = peer.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            let peer = candidate_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send((
                            peer,
                            LinkEvent::LocalCandidate(IceCandidateInit {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                        ));
                    }
                    Err(e) => warn!(%peer, error = %e, "dropping unserializable candidate"),
                }
            })
        }));

        let state_events = events.clone();
        let state_peer = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                debug!(%peer, %state, "connection state changed");
                let _ = events.send((peer, LinkEvent::StateChanged(map_state(state))));
            })
        }));

        let media = self.media.clone();
        let track_peer = peer.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let media = media.clone();
            let peer = track_peer.clone();
            Box::pin(async move {
                debug!(%peer, "remote track received");
                media.attach_remote(&peer, track).await;
            })
        }));

        Ok(Box::new(RtcLink { pc }))
    }
}

struct RtcLink {
    pc: Arc<RTCPeerConnection>,
}

impl RtcLink {
    /// The installed description keeps gathering candidates after
    /// `set_local_description`; read the current one back before sending.
    async fn local_description(&self, kind: SdpKind) -> Result<SessionDescription> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Transport("local description missing".to_string()))?;
        Ok(SessionDescription {
            kind,
            sdp: desc.sdp,
        })
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description(SdpKind::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description(SdpKind::Answer).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let desc = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

fn map_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}
