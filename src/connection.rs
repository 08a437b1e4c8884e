use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::signaling::{IceCandidateInit, ParticipantId, SessionDescription};

/// Lifecycle of one peer connection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::New => write!(f, "new"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Failed => write!(f, "failed"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Which side of a peer pair sends the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Deterministic, symmetric tie-break: the identity that sorts lower
    /// initiates. Both observers compute the same answer regardless of
    /// arrival order.
    pub fn between(me: &ParticipantId, peer: &ParticipantId) -> Role {
        if me < peer {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// Events a link pushes back to its owning session, tagged with the remote
/// peer so one channel can serve the whole mesh.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    LocalCandidate(IceCandidateInit),
    StateChanged(LinkState),
}

pub type LinkEventSender = mpsc::UnboundedSender<(ParticipantId, LinkEvent)>;

/// One leg of the mesh, backed by the host runtime's peer-connection stack.
///
/// `create_offer` and `create_answer` also install the result as the local
/// description; the session layer only moves descriptions across the wire.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Factory for peer links, injected at construction. The session never
/// probes for runtime capabilities; a missing stack is a configuration
/// error, not a runtime branch.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(&self, peer: &ParticipantId, events: LinkEventSender)
        -> Result<Box<dyn PeerLink>>;
}
