//! In-process reference implementation of [`SignalingChannel`].
//!
//! Mirrors the hierarchical shape of the hosted store: a `rooms` collection
//! keyed by room name, each room holding a `participants` sub-collection and
//! an append-only `signals` log. Hosts talking to a remote store implement
//! the same trait; this one backs the test suite and single-process embeds.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::signaling::{
    CreateOutcome, ParticipantEvent, ParticipantId, ParticipantRecord, RoomRecord,
    SignalingChannel, SignalingMessage, Subscription,
};

struct RoomSlot {
    record: RoomRecord,
    participants: BTreeMap<ParticipantId, ParticipantRecord>,
    signals: Vec<SignalingMessage>,
    participant_watchers: Vec<mpsc::UnboundedSender<ParticipantEvent>>,
    signal_watchers: Vec<mpsc::UnboundedSender<SignalingMessage>>,
}

impl RoomSlot {
    fn new(record: RoomRecord) -> Self {
        Self {
            record,
            participants: BTreeMap::new(),
            signals: Vec::new(),
            participant_watchers: Vec::new(),
            signal_watchers: Vec::new(),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    rooms: BTreeMap<String, RoomSlot>,
    index_watchers: Vec<mpsc::UnboundedSender<()>>,
}

impl StoreInner {
    fn notify_index(&mut self) {
        self.index_watchers.retain(|tx| tx.send(()).is_ok());
    }
}

impl RoomSlot {
    fn notify_participants(&mut self, event: ParticipantEvent) {
        self.participant_watchers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingChannel for MemoryStore {
    async fn create_room_if_absent(&self, name: &str, room: RoomRecord) -> Result<CreateOutcome> {
        let mut inner = self.inner.lock().await;
        if inner.rooms.contains_key(name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.rooms.insert(name.to_string(), RoomSlot::new(room));
        inner.notify_index();
        Ok(CreateOutcome::Created)
    }

    async fn room(&self, name: &str) -> Result<Option<RoomRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.rooms.get(name).map(|slot| slot.record.clone()))
    }

    async fn rooms(&self) -> Result<Vec<(RoomRecord, usize)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rooms
            .values()
            .map(|slot| (slot.record.clone(), slot.participants.len()))
            .collect())
    }

    async fn participants(&self, room: &str) -> Result<Vec<ParticipantRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rooms
            .get(room)
            .map(|slot| slot.participants.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_participant(&self, room: &str, record: ParticipantRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.rooms.get_mut(room) else {
            return Ok(());
        };
        let event = if slot.participants.contains_key(&record.id) {
            ParticipantEvent::Updated(record.clone())
        } else {
            ParticipantEvent::Added(record.clone())
        };
        slot.participants.insert(record.id.clone(), record);
        slot.notify_participants(event);
        inner.notify_index();
        Ok(())
    }

    async fn remove_participant(&self, room: &str, id: &ParticipantId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.rooms.get_mut(room) else {
            return Ok(());
        };
        if slot.participants.remove(id).is_some() {
            slot.notify_participants(ParticipantEvent::Removed(id.clone()));
            inner.notify_index();
        }
        Ok(())
    }

    async fn delete_room(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        // Dropping the slot closes its watcher channels, which readers see
        // as end-of-subscription.
        if inner.rooms.remove(name).is_some() {
            inner.notify_index();
        }
        Ok(())
    }

    async fn watch_participants(&self, room: &str) -> Result<Subscription<ParticipantEvent>> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(slot) = inner.rooms.get_mut(room) {
            // Child-added replay: existing members first, then live events.
            for record in slot.participants.values() {
                let _ = tx.send(ParticipantEvent::Added(record.clone()));
            }
            slot.participant_watchers.push(tx);
        }
        Ok(Subscription::new(rx))
    }

    async fn watch_rooms_index(&self) -> Result<Subscription<()>> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.index_watchers.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn publish_signal(&self, room: &str, message: SignalingMessage) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.rooms.get_mut(room) else {
            return Ok(());
        };
        slot.signal_watchers
            .retain(|tx| tx.send(message.clone()).is_ok());
        slot.signals.push(message);
        Ok(())
    }

    async fn watch_signals(&self, room: &str) -> Result<Subscription<SignalingMessage>> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(slot) = inner.rooms.get_mut(room) {
            // At-least-once: the full backlog replays on every subscribe.
            for message in &slot.signals {
                let _ = tx.send(message.clone());
            }
            slot.signal_watchers.push(tx);
        }
        Ok(Subscription::new(rx))
    }
}
