//! Top-level facade: one instance per signed-in user, holding at most one
//! room membership at a time. Owns the rollback paths that keep the store,
//! the mesh and the capture device consistent when a step fails halfway.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audio::MediaGateway;
use crate::config::SessionConfig;
use crate::connection::{LinkState, PeerConnector};
use crate::error::Result;
use crate::room::{RoomHandle, RoomRegistry, RoomSummary};
use crate::session::{PeerSessionManager, SessionEvent, SessionEventSender};
use crate::signaling::{ParticipantId, SignalingChannel};

pub struct VoiceChatController {
    identity: ParticipantId,
    channel: Arc<dyn SignalingChannel>,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaGateway>,
    registry: RoomRegistry,
    events: SessionEventSender,
    session: Option<PeerSessionManager>,
    current: Option<RoomHandle>,
    muted: bool,
    menu_watch: Option<JoinHandle<()>>,
}

impl VoiceChatController {
    /// The returned receiver carries every [`SessionEvent`] for the
    /// presentation layer, across room changes.
    pub fn new(
        identity: ParticipantId,
        display_name: String,
        config: SessionConfig,
        channel: Arc<dyn SignalingChannel>,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn MediaGateway>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = RoomRegistry::new(channel.clone(), identity.clone(), display_name, config);
        (
            Self {
                identity,
                channel,
                connector,
                media,
                registry,
                events,
                session: None,
                current: None,
                muted: false,
                menu_watch: None,
            },
            rx,
        )
    }

    pub fn identity(&self) -> &ParticipantId {
        &self.identity
    }

    pub fn current_room(&self) -> Option<&RoomHandle> {
        self.current.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub async fn peer_states(&self) -> Vec<(ParticipantId, LinkState)> {
        match &self.session {
            Some(session) => session.peer_states().await,
            None => Vec::new(),
        }
    }

    /// Snapshot for the room-selection view, plus a live watch that raises
    /// [`SessionEvent::RoomsChanged`] until [`close_menu`](Self::close_menu).
    pub async fn open_menu(&mut self) -> Result<Vec<RoomSummary>> {
        if self.menu_watch.is_none() {
            let mut index = self.channel.watch_rooms_index().await?;
            let events = self.events.clone();
            self.menu_watch = Some(tokio::spawn(async move {
                while index.recv().await.is_some() {
                    if events.send(SessionEvent::RoomsChanged).is_err() {
                        break;
                    }
                }
            }));
        }
        self.registry.list_rooms().await
    }

    pub fn close_menu(&mut self) {
        if let Some(watch) = self.menu_watch.take() {
            watch.abort();
        }
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>> {
        self.registry.list_rooms().await
    }

    /// The current room is left only once the create has landed; a rejected
    /// name leaves the existing membership untouched.
    pub async fn create_room(&mut self, name: &str, password: Option<String>) -> Result<()> {
        let handle = self.registry.create_room(name, password).await?;
        self.leave_current().await?;
        self.enter(handle).await
    }

    /// Joining the room already occupied is a no-op. Joining another room
    /// leaves the current one, but only after the new membership was
    /// accepted: a wrong password or a full room changes nothing.
    pub async fn join_room(&mut self, name: &str, password: Option<&str>) -> Result<()> {
        if self.current.as_ref().is_some_and(|h| h.name == name) {
            return Ok(());
        }
        let handle = self.registry.join_room(name, password).await?;
        self.leave_current().await?;
        self.enter(handle).await
    }

    pub async fn leave_room(&mut self) -> Result<()> {
        self.leave_current().await
    }

    /// Owner-only; on `NotOwner` the membership and the mesh stay intact.
    pub async fn delete_room(&mut self) -> Result<()> {
        let Some(handle) = self.current.clone() else {
            return Ok(());
        };
        self.registry.delete_room(&handle).await?;
        // Own eviction also arrives through the watch; tear down locally
        // rather than racing it.
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.current = None;
        self.media.release().await;
        Ok(())
    }

    /// Flips the mute flag, gates capture, and publishes the new state.
    pub async fn toggle_mute(&mut self) -> Result<bool> {
        self.muted = !self.muted;
        self.media.set_muted(self.muted).await;
        if let Some(handle) = &self.current {
            self.registry.set_muted(handle, self.muted).await?;
        }
        Ok(self.muted)
    }

    /// Retries playback sinks that were deferred by the output policy.
    pub async fn user_interaction(&self) {
        self.media.user_interaction().await;
    }

    /// Best-effort teardown for the host's unload path; never errors.
    pub async fn shutdown(&mut self) {
        self.close_menu();
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        if let Some(handle) = self.current.take() {
            self.registry.shutdown_cleanup(&handle).await;
        }
        self.media.release().await;
        info!(identity = %self.identity, "controller shut down");
    }

    /// Membership record is already written when this runs. Every later
    /// failure removes it again, so an aborted entry never leaves a ghost
    /// participant behind.
    async fn enter(&mut self, handle: RoomHandle) -> Result<()> {
        if let Err(e) = self.media.acquire().await {
            warn!(room = %handle.name, %e, "capture unavailable, rolling back membership");
            self.registry.shutdown_cleanup(&handle).await;
            return Err(e);
        }

        let session = match PeerSessionManager::start(
            &handle.name,
            self.identity.clone(),
            self.channel.clone(),
            self.connector.clone(),
            self.media.clone(),
            self.events.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.registry.shutdown_cleanup(&handle).await;
                self.media.release().await;
                return Err(e);
            }
        };

        if let Err(e) = self.registry.mark_active(&handle, self.muted).await {
            warn!(room = %handle.name, %e, "could not publish active status");
        }
        self.session = Some(session);
        self.current = Some(handle);
        Ok(())
    }

    async fn leave_current(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        if let Some(handle) = self.current.take() {
            self.registry.leave_room(&handle).await?;
        }
        self.media.release().await;
        Ok(())
    }
}

impl Drop for VoiceChatController {
    fn drop(&mut self) {
        if let Some(watch) = self.menu_watch.take() {
            watch.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::signaling::ParticipantStatus;
    use crate::store::MemoryStore;
    use crate::testutil::{wait_for, MockConnector, NullMedia};
    use async_trait::async_trait;
    use std::time::Duration;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
    use webrtc::track::track_remote::TrackRemote;

    fn controller(
        store: &Arc<MemoryStore>,
        id: &str,
    ) -> (
        VoiceChatController,
        mpsc::UnboundedReceiver<SessionEvent>,
        Arc<MockConnector>,
        Arc<NullMedia>,
    ) {
        let mut config = SessionConfig::default();
        config.create_retry_delay = Duration::from_millis(1);
        config.delete_settle_delay = Duration::from_millis(1);
        let connector = Arc::new(MockConnector::new(id));
        let media = Arc::new(NullMedia::default());
        let (c, rx) = VoiceChatController::new(
            ParticipantId::new(id),
            format!("{id}@example.com"),
            config,
            store.clone(),
            connector.clone(),
            media.clone(),
        );
        (c, rx, connector, media)
    }

    struct BrokenMedia;

    #[async_trait]
    impl MediaGateway for BrokenMedia {
        async fn acquire(&self) -> crate::error::Result<()> {
            Err(Error::PermissionDenied)
        }

        async fn release(&self) {}

        async fn set_muted(&self, _muted: bool) {}

        fn muted(&self) -> bool {
            false
        }

        fn local_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
            None
        }

        async fn attach_remote(&self, _peer: &ParticipantId, _track: Arc<TrackRemote>) {}

        async fn detach_remote(&self, _peer: &ParticipantId) {}

        async fn user_interaction(&self) {}
    }

    #[tokio::test]
    async fn create_enters_the_room_and_publishes_active_status() {
        let store = Arc::new(MemoryStore::new());
        let (mut c, _rx, _, _) = controller(&store, "u1");

        c.create_room("lounge", None).await.unwrap();
        assert_eq!(c.current_room().map(|h| h.name.as_str()), Some("lounge"));

        let members = store.participants("lounge").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].status, ParticipantStatus::Active);

        c.leave_room().await.unwrap();
        assert!(c.current_room().is_none());
        assert!(store.room("lounge").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capture_failure_rolls_the_membership_back() {
        let store = Arc::new(MemoryStore::new());
        let mut config = SessionConfig::default();
        config.create_retry_delay = Duration::from_millis(1);
        let (mut c, _rx) = VoiceChatController::new(
            ParticipantId::new("u1"),
            "u1@example.com".into(),
            config,
            store.clone(),
            Arc::new(MockConnector::new("u1")),
            Arc::new(BrokenMedia),
        );

        assert!(matches!(
            c.create_room("lounge", None).await,
            Err(Error::PermissionDenied)
        ));
        assert!(c.current_room().is_none());
        // The sole membership was rolled back, which also removed the room.
        assert!(store.room("lounge").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn joining_another_room_leaves_the_current_one() {
        let store = Arc::new(MemoryStore::new());
        let (mut u1, _rx1, _, _) = controller(&store, "u1");
        let (mut u2, _rx2, _, _) = controller(&store, "u2");

        u1.create_room("a", None).await.unwrap();
        u2.create_room("b", None).await.unwrap();

        u1.join_room("b", None).await.unwrap();
        assert!(store.room("a").await.unwrap().is_none());
        assert_eq!(store.participants("b").await.unwrap().len(), 2);

        // Same-room join is a no-op.
        u1.join_room("b", None).await.unwrap();
        assert_eq!(store.participants("b").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_create_keeps_the_current_membership() {
        let store = Arc::new(MemoryStore::new());
        let (mut u1, _rx1, _, _) = controller(&store, "u1");
        let (mut u2, _rx2, _, _) = controller(&store, "u2");

        u1.create_room("a", None).await.unwrap();
        u2.create_room("taken", None).await.unwrap();

        assert!(matches!(
            u1.create_room("taken", None).await,
            Err(Error::NameTaken)
        ));
        assert_eq!(u1.current_room().map(|h| h.name.as_str()), Some("a"));
        let members = store.participants("a").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, ParticipantId::new("u1"));
    }

    #[tokio::test]
    async fn failed_join_keeps_the_current_membership() {
        let store = Arc::new(MemoryStore::new());
        let (mut u1, _rx1, _, _) = controller(&store, "u1");
        let (mut u2, _rx2, _, _) = controller(&store, "u2");

        u1.create_room("a", None).await.unwrap();
        u2.create_room("vault", Some("s3cret".into())).await.unwrap();

        assert!(matches!(
            u1.join_room("vault", Some("wrong")).await,
            Err(Error::WrongPassword)
        ));
        assert!(matches!(
            u1.join_room("ghost", None).await,
            Err(Error::NotFound)
        ));
        assert_eq!(u1.current_room().map(|h| h.name.as_str()), Some("a"));
        assert!(store.room("a").await.unwrap().is_some());
        assert_eq!(store.participants("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mute_toggle_reaches_the_store_and_the_gateway() {
        let store = Arc::new(MemoryStore::new());
        let (mut c, _rx, _, media) = controller(&store, "u1");
        c.create_room("lounge", None).await.unwrap();

        assert!(c.toggle_mute().await.unwrap());
        assert!(media.muted());
        let members = store.participants("lounge").await.unwrap();
        assert!(members[0].muted);

        assert!(!c.toggle_mute().await.unwrap());
        assert!(!media.muted());
    }

    #[tokio::test]
    async fn leaving_tears_the_mesh_down() {
        let store = Arc::new(MemoryStore::new());
        let (mut u1, _rx1, c1, _) = controller(&store, "u1");
        let (mut u2, _rx2, _, _) = controller(&store, "u2");

        u1.create_room("lounge", None).await.unwrap();
        u2.join_room("lounge", None).await.unwrap();
        wait_for(|| async {
            u1.peer_states()
                .await
                .iter()
                .any(|(_, s)| *s == LinkState::Connected)
        })
        .await;
        assert_eq!(c1.opened(), 1);

        u1.leave_room().await.unwrap();
        assert!(u1.peer_states().await.is_empty());
        wait_for(|| async { u2.peer_states().await.is_empty() }).await;
        assert!(store.room("lounge").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn non_owner_delete_keeps_the_session() {
        let store = Arc::new(MemoryStore::new());
        let (mut u1, _rx1, _, _) = controller(&store, "u1");
        let (mut u2, _rx2, _, _) = controller(&store, "u2");

        u1.create_room("lounge", None).await.unwrap();
        u2.join_room("lounge", None).await.unwrap();

        assert!(matches!(u2.delete_room().await, Err(Error::NotOwner)));
        assert!(u2.current_room().is_some());
        assert_eq!(store.participants("lounge").await.unwrap().len(), 2);

        u1.delete_room().await.unwrap();
        assert!(u1.current_room().is_none());
        assert!(store.room("lounge").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn menu_watch_reports_index_changes() {
        let store = Arc::new(MemoryStore::new());
        let (mut viewer, mut rx, _, _) = controller(&store, "viewer");
        assert!(viewer.open_menu().await.unwrap().is_empty());

        let (mut other, _rx2, _, _) = controller(&store, "u1");
        other.create_room("lounge", None).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("index change within two seconds");
        assert!(matches!(event, Some(SessionEvent::RoomsChanged)));
        let rooms = viewer.list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "lounge");

        viewer.close_menu();
    }

    #[tokio::test]
    async fn dropping_the_controller_stops_the_menu_watch() {
        let store = Arc::new(MemoryStore::new());
        let (mut viewer, mut rx, _, _) = controller(&store, "viewer");
        viewer.open_menu().await.unwrap();
        drop(viewer);

        let (mut other, _rx2, _, _) = controller(&store, "u1");
        other.create_room("lounge", None).await.unwrap();

        // The aborted watch drops the last event sender, so the channel
        // closes instead of delivering RoomsChanged.
        let event = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(event, Ok(None)));
    }
}
