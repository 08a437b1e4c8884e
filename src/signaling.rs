//! Contract with the external real-time data store. The store is used purely
//! as a signaling transport: room and participant records plus an append-only
//! per-room signal log. Implementations must deliver signals at least once
//! (replay on resubscribe is expected); receivers never delete messages.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Stable authenticated user id. Keyed on the id rather than the display
/// string so that identities containing separator characters stay unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub name: String,
    pub owner: ParticipantId,
    pub password: Option<String>,
    pub created_at: u64,
}

impl RoomRecord {
    pub fn password_protected(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    /// Record written, media and mesh setup still in flight.
    Joining,
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    pub display_name: String,
    pub joined_at: u64,
    pub muted: bool,
    pub status: ParticipantStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description passed opaquely between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: SessionDescription },
    Answer { sdp: SessionDescription },
    IceCandidate { candidate: IceCandidateInit },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub sender: ParticipantId,
    /// `None` is a broadcast; `Some` must be ignored by everyone but the addressee.
    pub receiver: Option<ParticipantId>,
    #[serde(flatten)]
    pub payload: SignalPayload,
    pub sent_at: u64,
}

impl SignalingMessage {
    pub fn unicast(sender: ParticipantId, receiver: ParticipantId, payload: SignalPayload) -> Self {
        Self {
            sender,
            receiver: Some(receiver),
            payload,
            sent_at: now_millis(),
        }
    }

    /// Filter applied by every consumer: drop self-sent messages and unicasts
    /// addressed elsewhere.
    pub fn addressed_to(&self, me: &ParticipantId) -> bool {
        if &self.sender == me {
            return false;
        }
        match &self.receiver {
            Some(r) => r == me,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ParticipantEvent {
    Added(ParticipantRecord),
    Updated(ParticipantRecord),
    Removed(ParticipantId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Cancellable watch handle. Dropping it unsubscribes; no event is delivered
/// after the handle is gone.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// `None` means the watched entity disappeared (room deleted) or the
    /// store side shut down.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Atomic create-if-absent relative to concurrent callers on the same
    /// backing store. Never implemented as a read-then-write pair.
    async fn create_room_if_absent(&self, name: &str, room: RoomRecord) -> Result<CreateOutcome>;

    async fn room(&self, name: &str) -> Result<Option<RoomRecord>>;

    /// Snapshot of the room index with participant counts.
    async fn rooms(&self) -> Result<Vec<(RoomRecord, usize)>>;

    async fn participants(&self, room: &str) -> Result<Vec<ParticipantRecord>>;

    /// Insert or update; last writer wins at record level.
    async fn set_participant(&self, room: &str, record: ParticipantRecord) -> Result<()>;

    async fn remove_participant(&self, room: &str, id: &ParticipantId) -> Result<()>;

    async fn delete_room(&self, name: &str) -> Result<()>;

    /// Replays current members as `Added` before live events, matching the
    /// store's child-added semantics.
    async fn watch_participants(&self, room: &str) -> Result<Subscription<ParticipantEvent>>;

    /// Fires on any mutation under the room collection.
    async fn watch_rooms_index(&self) -> Result<Subscription<()>>;

    async fn publish_signal(&self, room: &str, message: SignalingMessage) -> Result<()>;

    /// Replays the room's backlog, then live messages. At-least-once.
    async fn watch_signals(&self, room: &str) -> Result<Subscription<SignalingMessage>>;
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_filtering() {
        let a = ParticipantId::new("a");
        let b = ParticipantId::new("b");
        let c = ParticipantId::new("c");
        let msg = SignalingMessage::unicast(
            a.clone(),
            b.clone(),
            SignalPayload::IceCandidate {
                candidate: IceCandidateInit {
                    candidate: "candidate:0 1 UDP 1 192.0.2.1 4444 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            },
        );
        assert!(msg.addressed_to(&b));
        assert!(!msg.addressed_to(&c));
        // Self-sent messages are always dropped.
        assert!(!msg.addressed_to(&a));
    }

    #[test]
    fn payload_round_trips_with_type_tag() {
        let msg = SignalingMessage {
            sender: ParticipantId::new("u1"),
            receiver: None,
            payload: SignalPayload::Offer {
                sdp: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".into(),
                },
            },
            sent_at: 7,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "offer");
        let back: SignalingMessage = serde_json::from_value(json).unwrap();
        assert!(matches!(back.payload, SignalPayload::Offer { .. }));
    }
}
