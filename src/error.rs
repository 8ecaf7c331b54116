use std::fmt;
use webrtc::Error as WebRTCError;
use tokio_tungstenite::tungstenite::Error as WsError;
use anyhow::Error as AnyhowError;

#[derive(Debug)]
pub enum Error {
    /// Microphone could not be opened. Fatal to the join flow.
    DeviceUnavailable(String),
    /// The user dismissed the screen picker.
    UserCancelled,
    /// No display capture on this backend.
    CaptureUnsupported(String),
    /// Relay connection is gone.
    SignalingUnavailable(String),
    /// Payload arrived for a link that is already closed.
    SignalRejected(String),
    /// Negotiation or ICE failure on a single link.
    PeerConnectionFailed(String),
    /// Operation needs a link that is still usable.
    NotReady(String),
    Config(String),
    /// The session task has finished; commands can no longer be delivered.
    SessionClosed,
    WebRTC(WebRTCError),
    Ws(WsError),
    Json(serde_json::Error),
    Other(AnyhowError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DeviceUnavailable(e) => write!(f, "Device unavailable: {}", e),
            Error::UserCancelled => write!(f, "Capture cancelled by user"),
            Error::CaptureUnsupported(e) => write!(f, "Capture unsupported: {}", e),
            Error::SignalingUnavailable(e) => write!(f, "Signaling unavailable: {}", e),
            Error::SignalRejected(peer) => write!(f, "Signal rejected for closed link to {}", peer),
            Error::PeerConnectionFailed(e) => write!(f, "Peer connection failed: {}", e),
            Error::NotReady(e) => write!(f, "Link not ready: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::SessionClosed => write!(f, "Session is closed"),
            Error::WebRTC(e) => write!(f, "WebRTC error: {}", e),
            Error::Ws(e) => write!(f, "WebSocket error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<WebRTCError> for Error {
    fn from(err: WebRTCError) -> Self {
        Error::WebRTC(err)
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Error::Ws(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<AnyhowError> for Error {
    fn from(err: AnyhowError) -> Self {
        Error::Other(err)
    }
}

/// Session-wide failures reported to the UI through `RoomEvent::FatalError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalErrorKind {
    DeviceUnavailable,
    SignalingUnavailable,
}

impl fmt::Display for FatalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalErrorKind::DeviceUnavailable => write!(f, "DeviceUnavailable"),
            FatalErrorKind::SignalingUnavailable => write!(f, "SignalingUnavailable"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
