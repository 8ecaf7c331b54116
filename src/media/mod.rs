pub mod capture;

pub use capture::CpalDevices;

use crate::error::Result;
use crate::event::{EventSender, SessionEvent};
use async_trait::async_trait;
use log::{debug, info};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "meshroom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local outgoing track. Clones share the same underlying track, enabled
/// flag and end notification.
#[derive(Clone)]
pub struct Track {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    local: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

impl Track {
    pub fn new(kind: TrackKind, codec: RTCRtpCodecCapability) -> Self {
        let prefix = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let id = format!("{}-{:08x}", prefix, rand::random::<u32>());
        let local = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            STREAM_ID.to_owned(),
        ));
        let (ended, _) = watch::channel(false);

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                local,
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    /// G.711 µ-law mono at 8 kHz.
    pub fn audio() -> Self {
        Self::new(
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
        )
    }

    pub fn video() -> Self {
        Self::new(
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.local.clone()
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.local.clone() as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Ends the track. Used both for a local stop and for a capture source
    /// going away underneath us.
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Tracks a new link should start sending.
#[derive(Debug, Clone, Default)]
pub struct LocalTracks {
    pub audio: Option<Track>,
    pub video: Option<Track>,
}

#[derive(Debug, Clone, Default)]
pub struct LocalMediaState {
    pub audio_muted: bool,
    pub screen_sharing: bool,
    pub active_video_track: Option<Track>,
}

/// Device access. Acquisition suspends the caller instead of blocking the
/// event loop.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    async fn acquire_microphone(&self) -> Result<Track>;

    /// Fails with `UserCancelled` or `CaptureUnsupported`.
    async fn acquire_screen(&self) -> Result<Track>;
}

/// Owns the local outgoing media and the `LocalMediaState` for one session.
pub struct MediaSource {
    devices: Box<dyn CaptureDevices>,
    events: EventSender,
    microphone: Option<Track>,
    state: LocalMediaState,
}

impl MediaSource {
    pub fn new(devices: Box<dyn CaptureDevices>, events: EventSender) -> Self {
        Self {
            devices,
            events,
            microphone: None,
            state: LocalMediaState::default(),
        }
    }

    pub async fn acquire_microphone(&mut self) -> Result<Track> {
        if let Some(track) = &self.microphone {
            return Ok(track.clone());
        }
        let track = self.devices.acquire_microphone().await?;
        track.set_enabled(!self.state.audio_muted);
        self.watch(&track);
        info!("Microphone acquired ({})", track.id());
        self.microphone = Some(track.clone());
        Ok(track)
    }

    /// Starts screen capture. On failure the sharing flag stays false.
    pub async fn acquire_screen(&mut self) -> Result<Track> {
        if let Some(track) = &self.state.active_video_track {
            return Ok(track.clone());
        }
        let track = self.devices.acquire_screen().await?;
        self.watch(&track);
        info!("Screen capture started ({})", track.id());
        self.state.screen_sharing = true;
        self.state.active_video_track = Some(track.clone());
        Ok(track)
    }

    /// Stops screen capture and hands back the track that was active.
    pub fn release_screen(&mut self) -> Option<Track> {
        self.state.screen_sharing = false;
        let track = self.state.active_video_track.take()?;
        track.stop();
        info!("Screen capture stopped ({})", track.id());
        Some(track)
    }

    /// Flips the audio track's enabled flag. The track stays attached to
    /// every link, so nothing is renegotiated.
    pub fn set_muted(&mut self, muted: bool) {
        self.state.audio_muted = muted;
        if let Some(track) = &self.microphone {
            track.set_enabled(!muted);
        }
    }

    pub fn stop_all(&mut self) {
        self.release_screen();
        if let Some(track) = self.microphone.take() {
            track.stop();
            debug!("Microphone released ({})", track.id());
        }
    }

    pub fn state(&self) -> &LocalMediaState {
        &self.state
    }

    pub fn microphone(&self) -> Option<&Track> {
        self.microphone.as_ref()
    }

    pub fn is_microphone(&self, track_id: &str) -> bool {
        self.microphone.as_ref().is_some_and(|t| t.id() == track_id)
    }

    pub fn is_active_screen(&self, track_id: &str) -> bool {
        self.state
            .active_video_track
            .as_ref()
            .is_some_and(|t| t.id() == track_id)
    }

    pub fn local_tracks(&self) -> LocalTracks {
        LocalTracks {
            audio: self.microphone.clone(),
            video: self.state.active_video_track.clone(),
        }
    }

    fn watch(&self, track: &Track) {
        let track = track.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = events.send(SessionEvent::TrackEnded {
                track_id: track.id().to_string(),
            });
        });
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.stop_all();
    }
}
