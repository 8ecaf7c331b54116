use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::event::{event_channel, Command, EventReceiver, EventSender, RoomEvents, SessionEvent};
use crate::media::{CaptureDevices, CpalDevices, MediaSource};
use crate::mesh::MeshCoordinator;
use crate::peer::{TransportFactory, WebRtcTransports};
use crate::signaling::{SignalingChannel, WsSignalingChannel};
use log::warn;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// The collaborators a session is assembled from.
pub struct SessionParts {
    pub signaling: Box<dyn SignalingChannel>,
    pub devices: Box<dyn CaptureDevices>,
    pub transports: Arc<dyn TransportFactory>,
}

/// Entry point for one stay in one room.
pub struct Session;

impl Session {
    /// Connects to the relay, opens the microphone and joins the room with
    /// the default device and transport backends.
    pub async fn join(config: SessionConfig) -> Result<(SessionHandle, RoomEvents)> {
        config.validate()?;
        let (events_tx, events_rx) = event_channel();
        let transports = Arc::new(WebRtcTransports::new(&config.ice_servers)?);
        let signaling = WsSignalingChannel::connect(&config.relay_address, events_tx.clone()).await?;

        let parts = SessionParts {
            signaling: Box::new(signaling),
            devices: Box::new(CpalDevices::new()),
            transports,
        };
        Self::start(config, parts, events_tx, events_rx).await
    }

    /// Joins with caller-supplied parts. `events_tx` must be the sender the
    /// signaling channel was connected with.
    pub async fn start(
        config: SessionConfig,
        mut parts: SessionParts,
        events_tx: EventSender,
        events_rx: EventReceiver,
    ) -> Result<(SessionHandle, RoomEvents)> {
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let mut media = MediaSource::new(parts.devices, events_tx.clone());

        if let Err(e) = media.acquire_microphone().await {
            if let Err(close_err) = parts.signaling.disconnect().await {
                warn!("Error disconnecting from relay: {}", close_err);
            }
            return Err(e);
        }

        let mut mesh = MeshCoordinator::new(
            config.room_id,
            config.display_name,
            parts.signaling,
            media,
            parts.transports,
            events_tx.clone(),
            ui_tx,
        );
        if let Err(e) = mesh.join().await {
            mesh.teardown().await;
            return Err(e);
        }

        let task = tokio::spawn(mesh.run(events_rx));
        Ok((
            SessionHandle {
                events: events_tx,
                task: Some(task),
            },
            ui_rx,
        ))
    }
}

/// Commands into a running session. Dropping the handle leaves the room.
pub struct SessionHandle {
    events: EventSender,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn toggle_mute(&self) -> Result<()> {
        self.send(Command::ToggleMute)
    }

    pub fn toggle_screen_share(&self) -> Result<()> {
        self.send(Command::ToggleScreenShare)
    }

    /// Leaves the room and waits until every resource has been released.
    pub async fn leave(mut self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self.send(Command::Leave { done: Some(done_tx) });
        if sent.is_ok() {
            let _ = done_rx.await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.events
            .send(SessionEvent::Command(command))
            .map_err(|_| Error::SessionClosed)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.task.take().is_some() {
            let _ = self.send(Command::Leave { done: None });
        }
    }
}
