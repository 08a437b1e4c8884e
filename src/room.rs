//! Room lifecycle: create, list, join, leave, delete, capacity and password
//! gating, empty-room cleanup.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{SessionConfig, ROOM_CAPACITY};
use crate::error::{Error, Result};
use crate::retry::with_backoff;
use crate::signaling::{
    now_millis, CreateOutcome, ParticipantId, ParticipantRecord, ParticipantStatus, RoomRecord,
    SignalingChannel,
};

#[derive(Debug, Clone)]
pub struct RoomSummary {
    pub name: String,
    pub participant_count: usize,
    pub password_protected: bool,
    pub owned_by_self: bool,
}

/// Proof of membership returned by create/join, consumed by leave/delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomHandle {
    pub name: String,
}

pub struct RoomRegistry {
    channel: Arc<dyn SignalingChannel>,
    identity: ParticipantId,
    display_name: String,
    config: SessionConfig,
}

impl RoomRegistry {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        identity: ParticipantId,
        display_name: String,
        config: SessionConfig,
    ) -> Self {
        Self {
            channel,
            identity,
            display_name,
            config,
        }
    }

    /// Lazy snapshot for the room-selection view; not restartable.
    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>> {
        let rooms = self.channel.rooms().await?;
        Ok(rooms
            .into_iter()
            .map(|(record, participant_count)| RoomSummary {
                password_protected: record.password_protected(),
                owned_by_self: record.owner == self.identity,
                name: record.name,
                participant_count,
            })
            .collect())
    }

    /// Atomic create with bounded retry. A name conflict that survives every
    /// attempt surfaces as `NameTaken` (the other creator won); exhausted
    /// transport failures surface as `CreateFailed`.
    pub async fn create_room(&self, name: &str, password: Option<String>) -> Result<RoomHandle> {
        let record = RoomRecord {
            name: name.to_string(),
            owner: self.identity.clone(),
            password: password.filter(|p| !p.is_empty()),
            created_at: now_millis(),
        };

        let channel = self.channel.clone();
        let outcome = with_backoff(
            self.config.create_retry_attempts,
            self.config.create_retry_delay,
            |e| e.is_transient() || matches!(e, Error::NameTaken),
            || {
                let channel = channel.clone();
                let record = record.clone();
                let name = record.name.clone();
                async move {
                    match channel.create_room_if_absent(&name, record).await {
                        Ok(CreateOutcome::Created) => Ok(()),
                        Ok(CreateOutcome::AlreadyExists) => Err(Error::NameTaken),
                        Err(e) => Err(e),
                    }
                }
            },
        )
        .await;

        match outcome {
            Ok(()) => {}
            Err(Error::NameTaken) => return Err(Error::NameTaken),
            Err(e) if e.is_transient() => {
                warn!(room = name, %e, "create exhausted retries");
                return Err(Error::CreateFailed);
            }
            Err(e) => return Err(e),
        }

        info!(room = name, owner = %self.identity, "created room");
        // Owner is the first participant.
        self.channel
            .set_participant(name, self.self_record(false))
            .await?;
        Ok(RoomHandle {
            name: name.to_string(),
        })
    }

    pub async fn join_room(&self, name: &str, password: Option<&str>) -> Result<RoomHandle> {
        let room = self.channel.room(name).await?.ok_or(Error::NotFound)?;

        // Plaintext comparison against the stored value, as the system has
        // always behaved. The host re-prompts and calls again on mismatch.
        if room.password_protected() && room.password.as_deref() != password {
            return Err(Error::WrongPassword);
        }

        let occupancy = self.channel.participants(name).await?.len();
        if occupancy >= ROOM_CAPACITY {
            return Err(Error::RoomFull(ROOM_CAPACITY));
        }

        self.channel
            .set_participant(name, self.self_record(false))
            .await?;
        info!(room = name, participant = %self.identity, "joined room");
        Ok(RoomHandle {
            name: name.to_string(),
        })
    }

    /// Removes the own record; if that left the room empty, deletes it. The
    /// check and the delete are separate store operations, so a join landing
    /// in between can observe a short-lived empty room. Accepted; the next
    /// leave repeats the check.
    pub async fn leave_room(&self, handle: &RoomHandle) -> Result<()> {
        self.channel
            .remove_participant(&handle.name, &self.identity)
            .await?;
        let remaining = self.channel.participants(&handle.name).await?.len();
        if remaining == 0 {
            debug!(room = %handle.name, "last participant left, deleting room");
            self.channel.delete_room(&handle.name).await?;
        }
        info!(room = %handle.name, participant = %self.identity, "left room");
        Ok(())
    }

    /// Owner-only. Evicts every participant independently, tolerating
    /// per-record failures, waits for the evictions to settle, then removes
    /// the room record. Ownership is re-fetched, never taken from a cache.
    pub async fn delete_room(&self, handle: &RoomHandle) -> Result<()> {
        let room = self
            .channel
            .room(&handle.name)
            .await?
            .ok_or(Error::NotFound)?;
        if room.owner != self.identity {
            return Err(Error::NotOwner);
        }

        for participant in self.channel.participants(&handle.name).await? {
            if let Err(e) = self
                .channel
                .remove_participant(&handle.name, &participant.id)
                .await
            {
                warn!(room = %handle.name, participant = %participant.id, %e, "eviction failed");
            }
        }

        sleep(self.config.delete_settle_delay).await;
        self.channel.delete_room(&handle.name).await?;
        info!(room = %handle.name, "room deleted by owner");
        Ok(())
    }

    /// Republishes the own record with `status = Active` once media and the
    /// session are up.
    pub async fn mark_active(&self, handle: &RoomHandle, muted: bool) -> Result<()> {
        self.update_self(handle, |r| {
            r.status = ParticipantStatus::Active;
            r.muted = muted;
        })
        .await
    }

    /// Publishes the new mute flag on the own record (last writer wins).
    pub async fn set_muted(&self, handle: &RoomHandle, muted: bool) -> Result<()> {
        self.update_self(handle, |r| r.muted = muted).await
    }

    /// Best-effort removal for the host's unload path. Never propagates:
    /// cleanup must not throw into a shutdown sequence.
    pub async fn shutdown_cleanup(&self, handle: &RoomHandle) {
        if let Err(e) = self.leave_room(handle).await {
            warn!(room = %handle.name, %e, "cleanup on shutdown failed");
        }
    }

    fn self_record(&self, muted: bool) -> ParticipantRecord {
        ParticipantRecord {
            id: self.identity.clone(),
            display_name: self.display_name.clone(),
            joined_at: now_millis(),
            muted,
            status: ParticipantStatus::Joining,
        }
    }

    async fn update_self<F: FnOnce(&mut ParticipantRecord)>(
        &self,
        handle: &RoomHandle,
        apply: F,
    ) -> Result<()> {
        // A missing own record means an eviction raced this update; writing
        // would resurrect the membership.
        let Some(mut record) = self
            .channel
            .participants(&handle.name)
            .await?
            .into_iter()
            .find(|r| r.id == self.identity)
        else {
            debug!(room = %handle.name, "own record gone, skipping update");
            return Ok(());
        };
        apply(&mut record);
        self.channel.set_participant(&handle.name, record).await
    }
}
