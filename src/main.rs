use log::{error, info, warn};
use meshroom::{RoomEvent, Session, SessionConfig};

#[tokio::main]
async fn main() -> meshroom::Result<()> {
    env_logger::init();

    let config = SessionConfig::from_env()?;
    info!(
        "Joining room {} as {} via {}",
        config.room_id, config.display_name, config.relay_address
    );

    let (session, mut events) = Session::join(config).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RoomEvent::ParticipantJoined { id, name }) => info!("{} joined ({})", name, id),
                Some(RoomEvent::ParticipantLeft { id }) => info!("{} left", id),
                Some(RoomEvent::RemoteTrack { id, track }) => info!("Receiving {:?} from {}", track.kind, id),
                Some(RoomEvent::LocalMuteChanged(muted)) => info!("Muted: {}", muted),
                Some(RoomEvent::ScreenShareChanged(sharing)) => info!("Screen sharing: {}", sharing),
                Some(RoomEvent::FatalError { kind, message }) => error!("{}: {}", kind, message),
                Some(RoomEvent::SessionClosed) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, leaving room");
                break;
            }
        }
    }

    session.leave().await
}
