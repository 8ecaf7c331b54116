#![allow(dead_code)]

use async_trait::async_trait;
use meshroom::event::{event_channel, EventReceiver, EventSender, RoomEvent, RoomEvents};
use meshroom::media::{CaptureDevices, LocalTracks, MediaSource, Track};
use meshroom::mesh::{Flow, MeshCoordinator};
use meshroom::peer::{LinkContext, PeerTransport, TransportFactory};
use meshroom::signaling::{RelayMessage, SignalingChannel};
use meshroom::{Error, LinkEvent, Result, SessionEvent, SignalPayload};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct RelayLog {
    pub history: Vec<RelayMessage>,
    pub outbox: VecDeque<RelayMessage>,
    pub disconnects: usize,
}

#[derive(Clone, Default)]
pub struct FakeSignaling {
    pub log: Arc<Mutex<RelayLog>>,
    pub fail_disconnect: bool,
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn send(&self, message: RelayMessage) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.history.push(message.clone());
        log.outbox.push_back(message);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.log.lock().unwrap().disconnects += 1;
        if self.fail_disconnect {
            return Err(Error::SignalingUnavailable("socket already gone".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeDevices {
    pub no_microphone: bool,
    pub screen_cancelled: bool,
    pub handed_out: Arc<Mutex<Vec<Track>>>,
}

#[async_trait]
impl CaptureDevices for FakeDevices {
    async fn acquire_microphone(&self) -> Result<Track> {
        if self.no_microphone {
            return Err(Error::DeviceUnavailable("permission denied".to_string()));
        }
        let track = Track::audio();
        self.handed_out.lock().unwrap().push(track.clone());
        Ok(track)
    }

    async fn acquire_screen(&self) -> Result<Track> {
        if self.screen_cancelled {
            return Err(Error::UserCancelled);
        }
        let track = Track::video();
        self.handed_out.lock().unwrap().push(track.clone());
        Ok(track)
    }
}

#[derive(Default)]
pub struct TransportLog {
    /// (remote id, new track id) for each swap that reached a transport.
    pub replaced: Vec<(String, Option<String>)>,
    pub closed: Vec<String>,
    pub opened: Vec<String>,
}

/// In-memory negotiation: offers are answered, and either side reports
/// readiness once it has applied the other's description.
#[derive(Default)]
pub struct FakeTransports {
    pub log: Arc<Mutex<TransportLog>>,
    pub failing_swaps: HashSet<String>,
    pub refuse_open: HashSet<String>,
    /// Stands in for ICE gathering before every offer.
    pub offer_delay: Option<Duration>,
}

struct FakeTransport {
    ctx: LinkContext,
    log: Arc<Mutex<TransportLog>>,
    fail_swaps: bool,
    offer_delay: Option<Duration>,
}

#[async_trait]
impl TransportFactory for FakeTransports {
    async fn open(&self, ctx: LinkContext, _tracks: &LocalTracks) -> Result<Box<dyn PeerTransport>> {
        if self.refuse_open.contains(&ctx.remote_id) {
            return Err(Error::PeerConnectionFailed("no route".to_string()));
        }
        self.log.lock().unwrap().opened.push(ctx.remote_id.clone());
        Ok(Box::new(FakeTransport {
            fail_swaps: self.failing_swaps.contains(&ctx.remote_id),
            offer_delay: self.offer_delay,
            ctx,
            log: self.log.clone(),
        }))
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SignalPayload> {
        if let Some(delay) = self.offer_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(SignalPayload::new(json!({"type": "offer", "sdp": "fake"})))
    }

    async fn apply_remote(&self, payload: SignalPayload) -> Result<Option<SignalPayload>> {
        let reply = match payload.as_value()["type"].as_str() {
            Some("offer") => Some(SignalPayload::new(json!({"type": "answer", "sdp": "fake"}))),
            Some("answer") => None,
            _ => return Err(Error::PeerConnectionFailed("unparseable payload".to_string())),
        };
        self.ctx.notify(LinkEvent::Ready);
        Ok(reply)
    }

    async fn replace_track(&self, _old: Option<&Track>, new: Option<&Track>) -> Result<()> {
        if self.fail_swaps {
            return Err(Error::PeerConnectionFailed("sender gone".to_string()));
        }
        self.log
            .lock()
            .unwrap()
            .replaced
            .push((self.ctx.remote_id.clone(), new.map(|t| t.id().to_string())));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().unwrap().closed.push(self.ctx.remote_id.clone());
        Ok(())
    }
}

/// One simulated participant, wired to fakes.
pub struct TestPeer {
    pub id: String,
    pub mesh: MeshCoordinator,
    pub events: EventReceiver,
    pub events_tx: EventSender,
    pub ui: RoomEvents,
    pub relay: Arc<Mutex<RelayLog>>,
    pub transports: Arc<Mutex<TransportLog>>,
    pub devices: FakeDevices,
}

pub struct PeerOptions {
    pub devices: FakeDevices,
    pub signaling: FakeSignaling,
    pub transports: FakeTransports,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            devices: FakeDevices::default(),
            signaling: FakeSignaling::default(),
            transports: FakeTransports::default(),
        }
    }
}

impl TestPeer {
    pub async fn new(id: &str) -> Self {
        Self::with_options(id, PeerOptions::default()).await
    }

    pub async fn with_options(id: &str, options: PeerOptions) -> Self {
        let (events_tx, events) = event_channel();
        let (ui_tx, ui) = mpsc::unbounded_channel();
        let relay = options.signaling.log.clone();
        let transports = options.transports.log.clone();
        let devices = options.devices.clone();

        let mut media = MediaSource::new(Box::new(options.devices), events_tx.clone());
        media.acquire_microphone().await.unwrap();

        let mut mesh = MeshCoordinator::new(
            "R1",
            id,
            Box::new(options.signaling),
            media,
            Arc::new(options.transports),
            events_tx.clone(),
            ui_tx,
        );
        mesh.join().await.unwrap();

        Self {
            id: id.to_string(),
            mesh,
            events,
            events_tx,
            ui,
            relay,
            transports,
            devices,
        }
    }

    pub async fn deliver(&mut self, event: SessionEvent) -> Flow {
        self.mesh.handle(event).await
    }

    pub fn ui_events(&mut self) -> Vec<RoomEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.ui.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn sent_history(&self) -> Vec<RelayMessage> {
        self.relay.lock().unwrap().history.clone()
    }

    fn take_outbox(&self) -> Vec<RelayMessage> {
        self.relay.lock().unwrap().outbox.drain(..).collect()
    }
}

/// The relay's view of a room: peers are indexed in join order, and
/// everyone already present hears about the newcomer.
pub async fn join(peers: &mut [TestPeer], newcomer: usize) {
    let id = peers[newcomer].id.clone();
    for peer in peers[..newcomer].iter_mut() {
        peer.deliver(SessionEvent::UserConnected {
            user_id: id.clone(),
            username: format!("{}-name", id),
        })
        .await;
    }
}

/// Runs every queued event and relays every outbound signal until the
/// whole group is quiet.
pub async fn pump(peers: &mut [TestPeer]) {
    loop {
        let mut progressed = false;

        // Let spawned watchers post their events.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        for peer in peers.iter_mut() {
            while let Ok(event) = peer.events.try_recv() {
                peer.mesh.handle(event).await;
                progressed = true;
            }
        }

        let mut deliveries = Vec::new();
        for peer in peers.iter() {
            for message in peer.take_outbox() {
                if let RelayMessage::Signal { user_id, signal } = message {
                    deliveries.push((user_id, peer.id.clone(), signal));
                }
            }
        }
        for (to, from, payload) in deliveries {
            if let Some(target) = peers.iter_mut().find(|p| p.id == to) {
                target.mesh.handle(SessionEvent::Signal { from, payload }).await;
                progressed = true;
            }
        }

        if !progressed {
            break;
        }
    }
}
