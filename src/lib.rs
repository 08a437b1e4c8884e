//! Voice chat over a full mesh of peer connections, coordinated through an
//! external real-time store used purely as a signaling transport.
//!
//! The store holds room and participant records plus an append-only signal
//! log per room; [`VoiceChatController`] drives the room lifecycle, the
//! negotiation mesh and the audio devices on top of it. Every seam is a
//! trait ([`SignalingChannel`], [`PeerConnector`], [`MediaGateway`]) so
//! sessions run unchanged against [`MemoryStore`] and mock links in tests.

pub mod audio;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
mod retry;
pub mod room;
pub mod session;
pub mod signaling;
pub mod store;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod testutil;

pub use audio::{CpalMediaGateway, MediaGateway};
pub use config::{AudioOptions, IceServerConfig, SessionConfig, ROOM_CAPACITY};
pub use connection::{LinkEvent, LinkState, PeerConnector, PeerLink, Role};
pub use controller::VoiceChatController;
pub use error::{Error, Result};
pub use room::{RoomHandle, RoomRegistry, RoomSummary};
pub use session::{PeerSessionManager, SessionEvent};
pub use signaling::{
    IceCandidateInit, ParticipantEvent, ParticipantId, ParticipantRecord, ParticipantStatus,
    RoomRecord, SdpKind, SessionDescription, SignalPayload, SignalingChannel, SignalingMessage,
    Subscription,
};
pub use store::MemoryStore;
pub use crate::webrtc::RtcPeerConnector;
