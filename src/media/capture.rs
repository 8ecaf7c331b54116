use super::{CaptureDevices, Track};
use crate::error::{Error, Result};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use log::{debug, error, info};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use webrtc::media::Sample as MediaSample;

const TARGET_RATE: u32 = 8000;
const FRAME_SAMPLES: usize = 160;
const FRAME_DURATION: Duration = Duration::from_millis(20);
pub(crate) const ULAW_SILENCE: u8 = 0xFF;

/// Default device backend: the host's default input device through cpal.
/// Display capture is not provided.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureDevices for CpalDevices {
    async fn acquire_microphone(&self) -> Result<Track> {
        let track = Track::audio();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (ready_tx, ready_rx) = oneshot::channel::<anyhow::Result<()>>();
        let runtime = Handle::current();
        let capture_track = track.clone();

        // cpal streams are not Send on every host, so the stream lives on
        // its own thread until the track ends.
        std::thread::Builder::new()
            .name("meshroom-mic".to_string())
            .spawn(move || {
                let stream = match open_input_stream(frame_tx, capture_track.clone()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(capture_track.ended());
                drop(stream);
                debug!("Input stream closed for {}", capture_track.id());
            })
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::DeviceUnavailable(e.to_string())),
            Err(_) => {
                return Err(Error::DeviceUnavailable(
                    "capture thread exited before the device opened".to_string(),
                ))
            }
        }

        tokio::spawn(forward_frames(track.clone(), frame_rx));
        Ok(track)
    }

    async fn acquire_screen(&self) -> Result<Track> {
        Err(Error::CaptureUnsupported(
            "no display capture backend is available".to_string(),
        ))
    }
}

fn open_input_stream(
    frames: mpsc::UnboundedSender<Vec<u8>>,
    track: Track,
) -> anyhow::Result<cpal::Stream> {
    let host = cpal::default_host();
    let input_device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No input device available"))?;

    let config = input_device.default_input_config()?;
    info!("Input config: {:?}", config);

    let stream_config: cpal::StreamConfig = config.clone().into();
    let encoder = PcmuEncoder::new(stream_config.sample_rate.0, stream_config.channels);

    let input_stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&input_device, &stream_config, encoder, frames, track)?,
        SampleFormat::I16 => build_input_stream::<i16>(&input_device, &stream_config, encoder, frames, track)?,
        SampleFormat::U16 => build_input_stream::<u16>(&input_device, &stream_config, encoder, frames, track)?,
        sample_format => return Err(anyhow!("Unsupported sample format: {:?}", sample_format)),
    };

    input_stream.play()?;
    Ok(input_stream)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut encoder: PcmuEncoder,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    track: Track,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = move |err: cpal::StreamError| {
        error!("An error occurred on the input audio stream: {}", err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            track.stop();
        }
    };

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in encoder.push(data.iter().map(|s| f32::from_sample(*s))) {
                let _ = frames.send(frame);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

async fn forward_frames(track: Track, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    let sample_track = track.sample_track();
    loop {
        tokio::select! {
            _ = track.ended() => break,
            frame = frames.recv() => {
                let Some(mut frame) = frame else { break };
                // Muted tracks stay attached and carry silence.
                if !track.is_enabled() {
                    frame.fill(ULAW_SILENCE);
                }
                let sample = MediaSample {
                    data: Bytes::from(frame),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = sample_track.write_sample(&sample).await {
                    debug!("Failed to write audio sample: {}", e);
                }
            }
        }
    }
}

/// Downmixes, decimates to 8 kHz and µ-law encodes into 20 ms frames.
pub(crate) struct PcmuEncoder {
    channels: usize,
    sample_rate: u32,
    phase: u32,
    channel_index: usize,
    mix: f32,
    frame: Vec<u8>,
}

impl PcmuEncoder {
    pub(crate) fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            sample_rate: sample_rate.max(1),
            phase: 0,
            channel_index: 0,
            mix: 0.0,
            frame: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    pub(crate) fn push(&mut self, samples: impl Iterator<Item = f32>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for sample in samples {
            self.mix += sample;
            self.channel_index += 1;
            if self.channel_index < self.channels {
                continue;
            }
            let mono = self.mix / self.channels as f32;
            self.mix = 0.0;
            self.channel_index = 0;

            self.phase += TARGET_RATE;
            if self.phase < self.sample_rate {
                continue;
            }
            self.phase %= self.sample_rate;

            let pcm = (mono.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            self.frame.push(linear_to_ulaw(pcm));
            if self.frame.len() == FRAME_SAMPLES {
                out.push(std::mem::replace(
                    &mut self.frame,
                    Vec::with_capacity(FRAME_SAMPLES),
                ));
            }
        }
        out
    }
}

/// G.711 µ-law.
pub(crate) fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut pcm = i32::from(sample);
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}
