pub mod config;
pub mod error;
pub mod event;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::SessionConfig;
pub use error::{Error, FatalErrorKind, Result};
pub use event::{Command, LinkEvent, RoomEvent, RoomEvents, SessionEvent};
pub use mesh::{MeshCoordinator, Participant};
pub use peer::{LinkState, PeerLink, Role};
pub use session::{Session, SessionHandle, SessionParts};
pub use signaling::{RelayMessage, SignalPayload};
