pub mod transport;

pub use transport::WebRtcTransports;

use crate::error::{Error, Result};
use crate::event::{EventSender, LinkEvent, SessionEvent};
use crate::media::{LocalTracks, Track};
use crate::signaling::SignalPayload;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Which side proposes first. The participant already in the room when
/// the other one joins is the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::Negotiating => write!(f, "Negotiating"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Closed => write!(f, "Closed"),
        }
    }
}

/// Identifies one link instance. A rejoin gets a fresh id, so events from a
/// torn-down transport can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lets a transport report on its connection from its own callbacks.
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub remote_id: String,
    pub link: LinkId,
    events: EventSender,
}

impl LinkContext {
    pub fn new(remote_id: impl Into<String>, link: LinkId, events: EventSender) -> Self {
        Self {
            remote_id: remote_id.into(),
            link,
            events,
        }
    }

    pub fn notify(&self, event: LinkEvent) {
        let _ = self.events.send(SessionEvent::Link {
            remote_id: self.remote_id.clone(),
            link: self.link,
            event,
        });
    }
}

/// The negotiation engine behind a link. Payloads it produces or consumes
/// are opaque to everything else.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SignalPayload>;

    /// Applies remote negotiation data and returns a reply when one is due.
    async fn apply_remote(&self, payload: SignalPayload) -> Result<Option<SignalPayload>>;

    async fn replace_track(&self, old: Option<&Track>, new: Option<&Track>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, ctx: LinkContext, tracks: &LocalTracks) -> Result<Box<dyn PeerTransport>>;
}

#[derive(Debug, Clone)]
struct TrackSwap {
    old: Option<Track>,
    new: Option<Track>,
}

/// Work for a link's negotiator task, run strictly in order.
enum Negotiate {
    Offer,
    Remote(SignalPayload),
}

/// Runs offer and answer generation away from the caller. ICE gathering
/// can take seconds, so results come back as link events.
fn spawn_negotiator(
    ctx: LinkContext,
    transport: Arc<dyn PeerTransport>,
) -> (mpsc::UnboundedSender<Negotiate>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let result = match job {
                Negotiate::Offer => transport
                    .create_offer()
                    .await
                    .map(|offer| ctx.notify(LinkEvent::LocalSignal(offer))),
                Negotiate::Remote(payload) => transport.apply_remote(payload).await.map(|reply| {
                    if let Some(reply) = reply {
                        ctx.notify(LinkEvent::LocalSignal(reply));
                    }
                    ctx.notify(LinkEvent::RemoteApplied);
                }),
            };
            if let Err(e) = result {
                ctx.notify(LinkEvent::Failed(e.to_string()));
                break;
            }
        }
    });
    (tx, task)
}

/// One connection to one remote participant.
pub struct PeerLink {
    id: LinkId,
    remote_id: String,
    role: Role,
    state: LinkState,
    transport: Arc<dyn PeerTransport>,
    negotiator: mpsc::UnboundedSender<Negotiate>,
    worker: JoinHandle<()>,
    pending_signal: VecDeque<SignalPayload>,
    pending_swap: Option<TrackSwap>,
    remote_applied: bool,
    transport_ready: bool,
}

impl PeerLink {
    pub fn new(ctx: LinkContext, role: Role, transport: Box<dyn PeerTransport>) -> Self {
        let transport: Arc<dyn PeerTransport> = Arc::from(transport);
        let id = ctx.link;
        let remote_id = ctx.remote_id.clone();
        let (negotiator, worker) = spawn_negotiator(ctx, transport.clone());
        Self {
            id,
            remote_id,
            role,
            state: LinkState::Idle,
            transport,
            negotiator,
            worker,
            pending_signal: VecDeque::new(),
            pending_swap: None,
            remote_applied: false,
            transport_ready: false,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Starts negotiating. The initiator has its offer built in the
    /// background; the responder waits for one.
    pub fn start(&mut self) {
        if self.state != LinkState::Idle {
            return;
        }
        if self.role == Role::Initiator {
            self.negotiate(Negotiate::Offer);
        }
        self.set_state(LinkState::Negotiating);
    }

    /// Hands a remote payload to the negotiator. The outcome arrives later
    /// as `LocalSignal`, `RemoteApplied` or `Failed`.
    pub fn receive_signal(&mut self, payload: SignalPayload) -> Result<()> {
        match self.state {
            LinkState::Closed => return Err(Error::SignalRejected(self.remote_id.clone())),
            LinkState::Idle => self.set_state(LinkState::Negotiating),
            _ => {}
        }
        self.negotiate(Negotiate::Remote(payload));
        Ok(())
    }

    /// Queues a payload the negotiator produced for the remote side.
    pub fn local_signal(&mut self, payload: SignalPayload) {
        if self.state != LinkState::Closed {
            self.pending_signal.push_back(payload);
        }
    }

    /// The remote description has been applied.
    pub async fn remote_applied(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        self.remote_applied = true;
        self.try_connect().await;
    }

    /// The transport reports that media can flow.
    pub async fn transport_ready(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        self.transport_ready = true;
        self.try_connect().await;
    }

    /// Outbound payloads produced since the last call, in order.
    pub fn take_local_signals(&mut self) -> Vec<SignalPayload> {
        self.pending_signal.drain(..).collect()
    }

    /// Swaps the outgoing video in place. Before the link is connected the
    /// swap is held back and applied once it is; a closed link refuses it.
    pub async fn replace_outgoing_track(&mut self, old: Option<&Track>, new: Option<&Track>) -> Result<()> {
        match self.state {
            LinkState::Connected => self.transport.replace_track(old, new).await,
            LinkState::Idle | LinkState::Negotiating => {
                let old = match self.pending_swap.take() {
                    Some(queued) => queued.old,
                    None => old.cloned(),
                };
                debug!("Link {} to {} not connected yet, holding track swap", self.id, self.remote_id);
                self.pending_swap = Some(TrackSwap {
                    old,
                    new: new.cloned(),
                });
                Ok(())
            }
            LinkState::Closed => Err(Error::NotReady(format!(
                "link {} to {} is closed",
                self.id, self.remote_id
            ))),
        }
    }

    /// Releases the transport. Safe to call in any state and more than once.
    pub async fn destroy(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        self.set_state(LinkState::Closed);
        self.worker.abort();
        self.pending_signal.clear();
        self.pending_swap = None;
        if let Err(e) = self.transport.close().await {
            warn!("Error closing link {} to {}: {}", self.id, self.remote_id, e);
        }
    }

    fn negotiate(&self, job: Negotiate) {
        if self.negotiator.send(job).is_err() {
            debug!("Negotiator for link {} to {} has stopped", self.id, self.remote_id);
        }
    }

    async fn try_connect(&mut self) {
        if self.state != LinkState::Negotiating || !self.remote_applied || !self.transport_ready {
            return;
        }
        self.set_state(LinkState::Connected);

        if let Some(swap) = self.pending_swap.take() {
            if let Err(e) = self
                .transport
                .replace_track(swap.old.as_ref(), swap.new.as_ref())
                .await
            {
                warn!("Deferred track swap on link {} failed: {}", self.id, e);
            }
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            info!(
                "Link {} to {} ({:?}): {} -> {}",
                self.id, self.remote_id, self.role, self.state, state
            );
            self.state = state;
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_channel, EventReceiver};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls {
        replaced: Vec<(Option<String>, Option<String>)>,
        closed: usize,
    }

    struct ScriptedTransport {
        calls: Arc<Mutex<Calls>>,
        stalled_offer: bool,
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn create_offer(&self) -> Result<SignalPayload> {
            if self.stalled_offer {
                std::future::pending::<()>().await;
            }
            Ok(SignalPayload::new(json!({"type": "offer"})))
        }

        async fn apply_remote(&self, payload: SignalPayload) -> Result<Option<SignalPayload>> {
            match payload.as_value()["type"].as_str() {
                Some("offer") => Ok(Some(SignalPayload::new(json!({"type": "answer"})))),
                Some("answer") => Ok(None),
                _ => Err(Error::PeerConnectionFailed("garbled payload".to_string())),
            }
        }

        async fn replace_track(&self, old: Option<&Track>, new: Option<&Track>) -> Result<()> {
            self.calls.lock().unwrap().replaced.push((
                old.map(|t| t.id().to_string()),
                new.map(|t| t.id().to_string()),
            ));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.calls.lock().unwrap().closed += 1;
            Ok(())
        }
    }

    struct Harness {
        link: PeerLink,
        calls: Arc<Mutex<Calls>>,
        events: EventReceiver,
        failures: Vec<String>,
    }

    impl Harness {
        fn new(role: Role) -> Self {
            Self::with_transport(role, false)
        }

        fn with_transport(role: Role, stalled_offer: bool) -> Self {
            let (tx, events) = event_channel();
            let calls = Arc::new(Mutex::new(Calls::default()));
            let transport = ScriptedTransport {
                calls: calls.clone(),
                stalled_offer,
            };
            let ctx = LinkContext::new("remote", LinkId(1), tx);
            Self {
                link: PeerLink::new(ctx, role, Box::new(transport)),
                calls,
                events,
                failures: Vec::new(),
            }
        }

        /// Feeds whatever the negotiator reported back into the link.
        async fn settle(&mut self) {
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            while let Ok(event) = self.events.try_recv() {
                let SessionEvent::Link { event, .. } = event else {
                    continue;
                };
                match event {
                    LinkEvent::LocalSignal(payload) => self.link.local_signal(payload),
                    LinkEvent::RemoteApplied => self.link.remote_applied().await,
                    LinkEvent::Ready => self.link.transport_ready().await,
                    LinkEvent::Failed(reason) => self.failures.push(reason),
                    LinkEvent::RemoteTrack(_) => {}
                }
            }
        }

        async fn connected(role: Role) -> Self {
            let mut h = Self::new(role);
            h.link.start();
            let payload = match role {
                Role::Initiator => json!({"type": "answer"}),
                Role::Responder => json!({"type": "offer"}),
            };
            h.link.receive_signal(SignalPayload::new(payload)).unwrap();
            h.settle().await;
            h.link.transport_ready().await;
            h.link.take_local_signals();
            h
        }
    }

    #[tokio::test]
    async fn initiator_sends_offer_after_start() {
        let mut h = Harness::new(Role::Initiator);
        assert_eq!(h.link.state(), LinkState::Idle);
        h.link.start();
        assert_eq!(h.link.state(), LinkState::Negotiating);

        h.settle().await;
        let out = h.link.take_local_signals();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_value()["type"], "offer");
        assert!(h.link.take_local_signals().is_empty());
    }

    #[tokio::test]
    async fn responder_answers_offer() {
        let mut h = Harness::new(Role::Responder);
        h.link.start();
        h.settle().await;
        assert!(h.link.take_local_signals().is_empty());

        h.link.receive_signal(SignalPayload::new(json!({"type": "offer"}))).unwrap();
        h.settle().await;
        let out = h.link.take_local_signals();
        assert_eq!(out[0].as_value()["type"], "answer");
        assert_eq!(h.link.state(), LinkState::Negotiating);
    }

    #[tokio::test]
    async fn connects_only_with_description_and_transport() {
        let mut h = Harness::new(Role::Initiator);
        h.link.start();
        h.link.transport_ready().await;
        assert_eq!(h.link.state(), LinkState::Negotiating);

        h.link.receive_signal(SignalPayload::new(json!({"type": "answer"}))).unwrap();
        assert_eq!(h.link.state(), LinkState::Negotiating);
        h.settle().await;
        assert_eq!(h.link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn unusable_payload_reports_failure() {
        let mut h = Harness::new(Role::Responder);
        h.link.start();
        h.link.receive_signal(SignalPayload::new(json!({"type": "bogus"}))).unwrap();
        h.settle().await;
        assert_eq!(h.failures.len(), 1);
        assert_eq!(h.link.state(), LinkState::Negotiating);
    }

    #[tokio::test]
    async fn stalled_negotiation_does_not_block_the_caller() {
        let mut h = Harness::with_transport(Role::Initiator, true);
        h.link.start();
        h.settle().await;
        assert_eq!(h.link.state(), LinkState::Negotiating);
        assert!(h.link.take_local_signals().is_empty());

        h.link.destroy().await;
        assert_eq!(h.link.state(), LinkState::Closed);
        assert_eq!(h.calls.lock().unwrap().closed, 1);
    }

    #[tokio::test]
    async fn closed_link_rejects_signals() {
        let mut h = Harness::connected(Role::Initiator).await;
        h.link.destroy().await;
        let result = h.link.receive_signal(SignalPayload::new(json!({"type": "answer"})));
        assert!(matches!(result, Err(Error::SignalRejected(_))));
    }

    #[tokio::test]
    async fn closed_link_drops_late_local_signals() {
        let mut h = Harness::connected(Role::Responder).await;
        h.link.destroy().await;
        h.link.local_signal(SignalPayload::new(json!({"type": "answer"})));
        assert!(h.link.take_local_signals().is_empty());
    }

    #[tokio::test]
    async fn destroy_twice_is_same_as_once() {
        let mut h = Harness::connected(Role::Responder).await;
        h.link.destroy().await;
        h.link.destroy().await;
        assert_eq!(h.link.state(), LinkState::Closed);
        assert_eq!(h.calls.lock().unwrap().closed, 1);
    }

    #[tokio::test]
    async fn replacing_track_keeps_link_connected() {
        let mut h = Harness::connected(Role::Initiator).await;
        assert_eq!(h.link.state(), LinkState::Connected);
        let screen = Track::video();

        h.link.replace_outgoing_track(None, Some(&screen)).await.unwrap();
        assert_eq!(h.link.state(), LinkState::Connected);
        assert_eq!(h.calls.lock().unwrap().replaced, vec![(None, Some(screen.id().to_string()))]);
    }

    #[tokio::test]
    async fn swap_during_negotiation_is_applied_on_connect() {
        let mut h = Harness::new(Role::Initiator);
        h.link.start();
        let first = Track::video();
        let second = Track::video();

        h.link.replace_outgoing_track(None, Some(&first)).await.unwrap();
        h.link.replace_outgoing_track(Some(&first), Some(&second)).await.unwrap();
        assert!(h.calls.lock().unwrap().replaced.is_empty());

        h.link.receive_signal(SignalPayload::new(json!({"type": "answer"}))).unwrap();
        h.settle().await;
        h.link.transport_ready().await;
        assert_eq!(h.link.state(), LinkState::Connected);
        assert_eq!(h.calls.lock().unwrap().replaced, vec![(None, Some(second.id().to_string()))]);
    }

    #[tokio::test]
    async fn swap_on_closed_link_is_not_ready() {
        let mut h = Harness::new(Role::Responder);
        h.link.destroy().await;
        let result = h.link.replace_outgoing_track(None, Some(&Track::video())).await;
        assert!(matches!(result, Err(Error::NotReady(_))));
    }
}
