use crate::error::{Error, FatalErrorKind};
use crate::event::{Command, EventReceiver, EventSender, LinkEvent, RoomEvent, RoomEventSender, SessionEvent};
use crate::media::{MediaSource, Track};
use crate::peer::{LinkContext, LinkId, LinkState, PeerLink, Role, TransportFactory};
use crate::signaling::{SignalPayload, SignalingChannel};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// How many departed ids are remembered. The relay hands out a fresh id per
/// connection, so an entry only has to outlive signals still in flight.
const TOMBSTONE_LIMIT: usize = 1024;

/// Ids whose late signals must not recreate a link, oldest evicted first.
#[derive(Debug, Default)]
struct Tombstones {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl Tombstones {
    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > TOMBSTONE_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|d| d != id);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Owns the room: the known participants, one link per participant, the
/// local media and the relay connection. Every input goes through
/// `handle`, one event at a time.
pub struct MeshCoordinator {
    room_id: String,
    display_name: String,
    signaling: Box<dyn SignalingChannel>,
    media: MediaSource,
    transports: Arc<dyn TransportFactory>,
    events: EventSender,
    ui: RoomEventSender,
    participants: HashMap<String, Participant>,
    links: HashMap<String, PeerLink>,
    departed: Tombstones,
    next_link: u64,
    closed: bool,
}

impl MeshCoordinator {
    pub fn new(
        room_id: impl Into<String>,
        display_name: impl Into<String>,
        signaling: Box<dyn SignalingChannel>,
        media: MediaSource,
        transports: Arc<dyn TransportFactory>,
        events: EventSender,
        ui: RoomEventSender,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: display_name.into(),
            signaling,
            media,
            transports,
            events,
            ui,
            participants: HashMap::new(),
            links: HashMap::new(),
            departed: Tombstones::default(),
            next_link: 0,
            closed: false,
        }
    }

    pub async fn join(&mut self) -> crate::Result<()> {
        info!("Joining room {} as {}", self.room_id, self.display_name);
        self.signaling.join_room(&self.room_id, &self.display_name).await
    }

    /// Processes events until the session ends, then tears everything down.
    pub async fn run(mut self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            if self.handle(event).await == Flow::Stop {
                break;
            }
        }
        self.teardown().await;
    }

    pub async fn handle(&mut self, event: SessionEvent) -> Flow {
        if self.closed {
            if let SessionEvent::Command(Command::Leave { done: Some(done) }) = event {
                let _ = done.send(());
            }
            return Flow::Stop;
        }

        match event {
            SessionEvent::UserConnected { user_id, username } => {
                self.on_user_connected(user_id, username).await
            }
            SessionEvent::UserDisconnected { user_id } => self.on_user_disconnected(&user_id).await,
            SessionEvent::Signal { from, payload } => self.on_signal(from, payload).await,
            SessionEvent::SignalingLost { reason } => {
                self.fatal(FatalErrorKind::SignalingUnavailable, reason).await;
                return Flow::Stop;
            }
            SessionEvent::Link { remote_id, link, event } => {
                self.on_link_event(remote_id, link, event).await
            }
            SessionEvent::TrackEnded { track_id } => {
                if self.media.is_active_screen(&track_id) {
                    info!("Screen capture ended by the system");
                    self.stop_screen_share().await;
                } else if self.media.is_microphone(&track_id) {
                    self.fatal(FatalErrorKind::DeviceUnavailable, "microphone was lost".to_string())
                        .await;
                    return Flow::Stop;
                }
            }
            SessionEvent::Command(Command::ToggleMute) => self.toggle_mute(),
            SessionEvent::Command(Command::ToggleScreenShare) => self.toggle_screen_share().await,
            SessionEvent::Command(Command::Leave { done }) => {
                info!("Leaving room {}", self.room_id);
                self.teardown().await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn on_user_connected(&mut self, user_id: String, username: String) {
        if self.links.contains_key(&user_id) {
            warn!("Duplicate user-connected for {}, keeping the existing link", user_id);
            return;
        }
        info!("{} ({}) joined", username, user_id);
        self.departed.remove(&user_id);
        self.add_participant(user_id.clone(), username);
        self.open_link(&user_id, Role::Initiator).await;
    }

    async fn on_user_disconnected(&mut self, user_id: &str) {
        let had_link = match self.links.remove(user_id) {
            Some(mut link) => {
                link.destroy().await;
                true
            }
            None => false,
        };
        let had_participant = self.participants.remove(user_id).is_some();
        self.departed.insert(user_id);

        if had_participant {
            info!("{} left", user_id);
            self.emit(RoomEvent::ParticipantLeft { id: user_id.to_string() });
        } else if !had_link {
            debug!("Ignoring user-disconnected for unknown participant {}", user_id);
        }
    }

    async fn on_signal(&mut self, from: String, payload: SignalPayload) {
        if self.departed.contains(&from) {
            debug!("{}", Error::SignalRejected(from));
            return;
        }

        if !self.links.contains_key(&from) {
            // The remote is the initiator and we are the late joiner. The
            // relay never told us its name.
            if !self.participants.contains_key(&from) {
                self.add_participant(from.clone(), from.clone());
            }
            self.open_link(&from, Role::Responder).await;
        }

        if let Some(link) = self.links.get_mut(&from) {
            if let Err(e) = link.receive_signal(payload) {
                debug!("Dropping signal from {}: {}", from, e);
            }
        }
    }

    async fn on_link_event(&mut self, remote_id: String, link_id: LinkId, event: LinkEvent) {
        let current = self
            .links
            .get(&remote_id)
            .is_some_and(|link| link.id() == link_id);
        if !current {
            debug!("Ignoring event from stale link {} to {}", link_id, remote_id);
            return;
        }

        match event {
            LinkEvent::LocalSignal(payload) => {
                if let Some(link) = self.links.get_mut(&remote_id) {
                    link.local_signal(payload);
                }
                self.flush_signals(&remote_id).await;
            }
            LinkEvent::RemoteApplied => {
                if let Some(link) = self.links.get_mut(&remote_id) {
                    link.remote_applied().await;
                }
            }
            LinkEvent::Ready => {
                if let Some(link) = self.links.get_mut(&remote_id) {
                    link.transport_ready().await;
                }
            }
            LinkEvent::Failed(reason) => {
                self.fail_link(&remote_id, Error::PeerConnectionFailed(reason)).await
            }
            LinkEvent::RemoteTrack(track) => self.emit(RoomEvent::RemoteTrack {
                id: remote_id,
                track,
            }),
        }
    }

    async fn open_link(&mut self, remote_id: &str, role: Role) {
        self.next_link += 1;
        let link_id = LinkId(self.next_link);
        let ctx = LinkContext::new(remote_id, link_id, self.events.clone());
        let tracks = self.media.local_tracks();

        let transport = match self.transports.open(ctx.clone(), &tracks).await {
            Ok(transport) => transport,
            Err(e) => {
                self.fail_link(remote_id, e).await;
                return;
            }
        };

        // Offers and answers are produced off the loop and come back as
        // `LinkEvent::LocalSignal`.
        let mut link = PeerLink::new(ctx, role, transport);
        link.start();
        self.links.insert(remote_id.to_string(), link);
    }

    async fn flush_signals(&mut self, remote_id: &str) {
        let Some(link) = self.links.get_mut(remote_id) else {
            return;
        };
        for payload in link.take_local_signals() {
            if let Err(e) = self.signaling.send_signal(remote_id, payload).await {
                warn!("Failed to forward signal to {}: {}", remote_id, e);
            }
        }
    }

    /// Drops one link and its participant. The rest of the mesh is untouched.
    async fn fail_link(&mut self, remote_id: &str, err: Error) {
        warn!("Link to {} failed: {}", remote_id, err);
        if let Some(mut link) = self.links.remove(remote_id) {
            link.destroy().await;
        }
        self.departed.insert(remote_id);
        if self.participants.remove(remote_id).is_some() {
            self.emit(RoomEvent::ParticipantLeft { id: remote_id.to_string() });
        }
    }

    fn add_participant(&mut self, id: String, display_name: String) {
        self.emit(RoomEvent::ParticipantJoined {
            id: id.clone(),
            name: display_name.clone(),
        });
        self.participants.insert(id.clone(), Participant { id, display_name });
    }

    fn toggle_mute(&mut self) {
        let muted = !self.media.state().audio_muted;
        self.media.set_muted(muted);
        self.emit(RoomEvent::LocalMuteChanged(muted));
    }

    async fn toggle_screen_share(&mut self) {
        if self.media.state().screen_sharing {
            self.stop_screen_share().await;
            return;
        }

        match self.media.acquire_screen().await {
            Ok(screen) => {
                self.replace_on_every_link(None, Some(&screen)).await;
                self.emit(RoomEvent::ScreenShareChanged(true));
            }
            Err(e) => {
                warn!("Screen share not started: {}", e);
                self.emit(RoomEvent::ScreenShareChanged(false));
            }
        }
    }

    async fn stop_screen_share(&mut self) {
        if let Some(screen) = self.media.release_screen() {
            self.replace_on_every_link(Some(&screen), None).await;
        }
        self.emit(RoomEvent::ScreenShareChanged(false));
    }

    async fn replace_on_every_link(&mut self, old: Option<&Track>, new: Option<&Track>) {
        for (remote_id, link) in self.links.iter_mut() {
            if let Err(e) = link.replace_outgoing_track(old, new).await {
                warn!("Track swap on link to {} failed: {}", remote_id, e);
            }
        }
    }

    async fn fatal(&mut self, kind: FatalErrorKind, message: String) {
        error!("{}: {}", kind, message);
        self.emit(RoomEvent::FatalError { kind, message });
        self.teardown().await;
    }

    /// Releases links, media and the relay connection. Each step runs even
    /// when an earlier one fails.
    pub async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for (_, mut link) in self.links.drain() {
            link.destroy().await;
        }
        self.participants.clear();
        self.media.stop_all();
        if let Err(e) = self.signaling.disconnect().await {
            warn!("Error disconnecting from relay: {}", e);
        }
        self.emit(RoomEvent::SessionClosed);
        info!("Session for room {} closed", self.room_id);
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.ui.send(event);
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn link(&self, remote_id: &str) -> Option<&PeerLink> {
        self.links.get(remote_id)
    }

    pub fn link_states(&self) -> HashMap<String, LinkState> {
        self.links
            .iter()
            .map(|(id, link)| (id.clone(), link.state()))
            .collect()
    }

    pub fn media(&self) -> &MediaSource {
        &self.media
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
