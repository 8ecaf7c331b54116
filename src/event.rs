use crate::error::FatalErrorKind;
use crate::media::TrackKind;
use crate::peer::LinkId;
use crate::signaling::SignalPayload;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use webrtc::track::track_remote::TrackRemote;

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;
pub type RoomEventSender = mpsc::UnboundedSender<RoomEvent>;
pub type RoomEvents = mpsc::UnboundedReceiver<RoomEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Every input the coordinator reacts to. Relay frames, transport callbacks,
/// track notifications and UI commands all arrive through this one type.
#[derive(Debug)]
pub enum SessionEvent {
    UserConnected { user_id: String, username: String },
    UserDisconnected { user_id: String },
    Signal { from: String, payload: SignalPayload },
    SignalingLost { reason: String },
    Link { remote_id: String, link: LinkId, event: LinkEvent },
    TrackEnded { track_id: String },
    Command(Command),
}

#[derive(Debug)]
pub enum Command {
    ToggleMute,
    ToggleScreenShare,
    Leave { done: Option<oneshot::Sender<()>> },
}

/// Reported by a link's negotiator or its transport.
#[derive(Debug)]
pub enum LinkEvent {
    /// Negotiation data to forward to the remote participant.
    LocalSignal(SignalPayload),
    /// The last remote payload has been applied.
    RemoteApplied,
    Ready,
    Failed(String),
    RemoteTrack(RemoteTrack),
}

/// Incoming media from a remote participant, handed to the UI for playback.
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("attached", &self.track.is_some())
            .finish()
    }
}

/// What the UI layer renders.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    ParticipantJoined { id: String, name: String },
    ParticipantLeft { id: String },
    LocalMuteChanged(bool),
    ScreenShareChanged(bool),
    RemoteTrack { id: String, track: RemoteTrack },
    FatalError { kind: FatalErrorKind, message: String },
    SessionClosed,
}
