use super::{LinkContext, PeerTransport, TransportFactory};
use crate::error::{Error, Result};
use crate::event::{LinkEvent, RemoteTrack};
use crate::media::{LocalTracks, Track, TrackKind};
use crate::signaling::SignalPayload;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

const GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// What can arrive in a signal: a full description (non-trickle) or a
/// single candidate from a trickling peer.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Negotiation {
    Description(RTCSessionDescription),
    Candidate { candidate: RTCIceCandidateInit },
}

/// Builds webrtc-rs peer connections sharing one media engine.
pub struct WebRtcTransports {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcTransports {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .build();

        // Without servers only host candidates are gathered.
        let mut config = RTCConfiguration::default();
        if !ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }];
        }

        Ok(Self { api, config })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransports {
    async fn open(&self, ctx: LinkContext, tracks: &LocalTracks) -> Result<Box<dyn PeerTransport>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        if let Some(audio) = &tracks.audio {
            let sender = peer_connection.add_track(audio.rtc_track()).await?;
            drain_rtcp(sender);
        }

        // One video slot per link; screen share swaps its track in and out.
        let video = peer_connection
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await?;
        let video_sender = video.sender().await;
        if let Some(track) = &tracks.video {
            video_sender.replace_track(Some(track.rtc_track())).await?;
        }
        drain_rtcp(video_sender.clone());

        // Set up connection state monitoring
        let state_ctx = ctx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let ctx = state_ctx.clone();
            Box::pin(async move {
                debug!("Peer Connection State for {} has changed: {}", ctx.remote_id, s);
                match s {
                    RTCPeerConnectionState::Connected => ctx.notify(LinkEvent::Ready),
                    RTCPeerConnectionState::Failed => {
                        ctx.notify(LinkEvent::Failed("peer connection failed".to_string()))
                    }
                    _ => {}
                }
            })
        }));

        let ice_ctx = ctx.clone();
        peer_connection.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let remote_id = ice_ctx.remote_id.clone();
            Box::pin(async move {
                debug!("ICE Connection State for {} has changed: {}", remote_id, s);
            })
        }));

        // Set up track handling
        let track_ctx = ctx.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let ctx = track_ctx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    info!("Remote {:?} track from {}", kind, ctx.remote_id);
                    ctx.notify(LinkEvent::RemoteTrack(RemoteTrack {
                        kind,
                        track: Some(track),
                    }));
                })
            },
        ));

        Ok(Box::new(WebRtcTransport {
            peer_connection,
            video_sender,
            remote_id: ctx.remote_id,
        }))
    }
}

// Senders must be read for interceptors (NACK, reports) to run.
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

/// One webrtc-rs peer connection. Descriptions are sent whole, after ICE
/// gathering, as `{"type": ..., "sdp": ...}`.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
    remote_id: String,
}

impl WebRtcTransport {
    async fn gathered_local_description(&self, description: RTCSessionDescription) -> Result<SignalPayload> {
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(description).await?;

        if tokio::time::timeout(GATHER_TIMEOUT, gather_complete.recv()).await.is_err() {
            warn!("ICE gathering for {} timed out, sending what we have", self.remote_id);
        }

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::PeerConnectionFailed("no local description after gathering".to_string()))?;
        Ok(SignalPayload::new(serde_json::to_value(&local)?))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SignalPayload> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.gathered_local_description(offer).await
    }

    async fn apply_remote(&self, payload: SignalPayload) -> Result<Option<SignalPayload>> {
        match serde_json::from_value::<Negotiation>(payload.into_value())? {
            Negotiation::Description(description) => {
                let is_offer = description.sdp_type == RTCSdpType::Offer;
                self.peer_connection.set_remote_description(description).await?;
                if !is_offer {
                    return Ok(None);
                }
                let answer = self.peer_connection.create_answer(None).await?;
                Ok(Some(self.gathered_local_description(answer).await?))
            }
            Negotiation::Candidate { candidate } => {
                self.peer_connection.add_ice_candidate(candidate).await?;
                Ok(None)
            }
        }
    }

    async fn replace_track(&self, _old: Option<&Track>, new: Option<&Track>) -> Result<()> {
        self.video_sender
            .replace_track(new.map(Track::rtc_track))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
