//! Local capture source: the one stream every peer link shares.
//!
//! At most one local stream is active at a time. Toggling a kind flips the
//! enabled flag on every track of that kind in the current stream; it never
//! creates a new stream and never touches the peer links, so receivers see
//! a muted track rather than a removed one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample as _, SampleFormat, SizedSample};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};

/// Lowercase alphanumeric id, the shape the relay protocol uses everywhere.
pub(crate) fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Capture request for a join: which kinds, and the preferred video size.
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
        }
    }
}

/// One local track. The engine track is shared read-only by every peer
/// link; only the media source flips enablement or stops it.
pub struct LocalTrack {
    kind: MediaKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    fn new(kind: MediaKind, stream_id: &str) -> Self {
        let (mime, track_id) = match kind {
            MediaKind::Audio => (MIME_TYPE_OPUS, format!("audio-{}", random_id(8))),
            MediaKind::Video => (MIME_TYPE_VP8, format!("video-{}", random_id(8))),
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            track_id,
            stream_id.to_owned(),
        ));
        Self {
            kind,
            rtc,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        use webrtc::track::track_local::TrackLocal;
        self.rtc.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub(crate) fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    /// Write captured media. While the track is disabled or stopped the
    /// payload is dropped, which is what mutes the track for receivers.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(());
        }
        self.rtc.write_sample(sample).await?;
        Ok(())
    }
}

/// One acquired capture session: a stream id plus its tracks.
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn audio_track(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks_of(MediaKind::Audio).next()
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Owner of the capture device handle.
#[derive(Default)]
pub struct LocalMediaSource {
    current: Option<LocalStream>,
}

impl LocalMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a fresh stream, stopping and replacing any existing one
    /// first. Two capture sessions never run concurrently.
    pub fn acquire(&mut self, constraints: &MediaConstraints) -> Result<&LocalStream> {
        if !constraints.audio && !constraints.video {
            return Err(Error::MediaAccess("no media kinds requested".into()));
        }
        self.release();

        let id = format!("local-{}", random_id(8));
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Audio, &id)));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Video, &id)));
        }
        debug!(
            stream = %id,
            width = constraints.width,
            height = constraints.height,
            "acquired local stream"
        );
        Ok(self.current.insert(LocalStream { id, tracks }))
    }

    /// Stop every track and clear the handle.
    pub fn release(&mut self) {
        if let Some(stream) = self.current.take() {
            for track in stream.tracks() {
                track.stop();
            }
        }
    }

    /// Flip enablement on every track of `kind` in the current stream.
    /// Returns false when no stream is active.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        match &self.current {
            Some(stream) => {
                for track in stream.tracks_of(kind) {
                    track.set_enabled(enabled);
                }
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<&LocalStream> {
        self.current.as_ref()
    }
}

/// Default-device audio capture feeding one local track.
///
/// The cpal stream is not `Send`, so it lives on its own thread; dropping
/// the handle stops the device.
pub struct AudioCapture {
    stop: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioCapture {
    pub fn start(track: Arc<LocalTrack>) -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::spawn(move || {
            let stream = match build_input_stream(track) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Parked until the handle drops its sender.
            let _ = stop_rx.recv();
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(Error::MediaAccess("audio capture thread died".into())),
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_input_stream(track: Arc<LocalTrack>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaAccess("no audio input device available".into()))?;
    let config = device
        .default_input_config()
        .map_err(|e| Error::MediaAccess(e.to_string()))?;

    let stream = match config.sample_format() {
        SampleFormat::F32 => run_input::<f32>(&device, &config.into(), track)?,
        SampleFormat::I16 => run_input::<i16>(&device, &config.into(), track)?,
        SampleFormat::U16 => run_input::<u16>(&device, &config.into(), track)?,
        other => {
            return Err(Error::MediaAccess(format!(
                "unsupported sample format: {:?}",
                other
            )))
        }
    };
    stream
        .play()
        .map_err(|e| Error::MediaAccess(e.to_string()))?;
    Ok(stream)
}

fn run_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    track: Arc<LocalTrack>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let sample_rate = config.sample_rate.0.max(1);
    let channels = config.channels.max(1) as u32;
    let err_fn = |err: cpal::StreamError| warn!("audio input stream error: {}", err);

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut pcm = Vec::with_capacity(data.len() * 2);
                for s in data {
                    let v = f32::from_sample(*s).clamp(-1.0, 1.0);
                    pcm.extend_from_slice(&((v * i16::MAX as f32) as i16).to_le_bytes());
                }
                let frames = data.len() as u32 / channels;
                let sample = Sample {
                    data: Bytes::from(pcm),
                    duration: Duration::from_secs_f64(f64::from(frames) / f64::from(sample_rate)),
                    ..Default::default()
                };
                if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                    warn!("failed to write audio sample: {}", e);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::MediaAccess(e.to_string()))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_replaces_and_stops_previous_stream() {
        let mut source = LocalMediaSource::new();
        let first_id = source
            .acquire(&MediaConstraints::default())
            .unwrap()
            .id()
            .to_string();
        let first_tracks: Vec<_> = source
            .current()
            .unwrap()
            .tracks()
            .iter()
            .cloned()
            .collect();

        let second_id = source
            .acquire(&MediaConstraints::default())
            .unwrap()
            .id()
            .to_string();

        assert_ne!(first_id, second_id);
        assert!(first_tracks.iter().all(|t| t.is_stopped()));
        assert!(source
            .current()
            .unwrap()
            .tracks()
            .iter()
            .all(|t| !t.is_stopped()));
    }

    #[test]
    fn toggling_flips_only_the_requested_kind_and_keeps_identity() {
        let mut source = LocalMediaSource::new();
        let stream_id = source
            .acquire(&MediaConstraints::default())
            .unwrap()
            .id()
            .to_string();
        let track_ids: Vec<String> = source
            .current()
            .unwrap()
            .tracks()
            .iter()
            .map(|t| t.id().to_string())
            .collect();

        assert!(source.set_enabled(MediaKind::Audio, false));
        {
            let stream = source.current().unwrap();
            assert!(stream.tracks_of(MediaKind::Audio).all(|t| !t.is_enabled()));
            assert!(stream.tracks_of(MediaKind::Video).all(|t| t.is_enabled()));
        }

        assert!(source.set_enabled(MediaKind::Audio, true));
        let stream = source.current().unwrap();
        assert!(stream.tracks().iter().all(|t| t.is_enabled()));

        // Same stream, same tracks: toggling never re-acquires.
        assert_eq!(stream.id(), stream_id);
        let after: Vec<String> = stream.tracks().iter().map(|t| t.id().to_string()).collect();
        assert_eq!(after, track_ids);
    }

    #[test]
    fn empty_constraints_are_a_media_error() {
        let mut source = LocalMediaSource::new();
        let err = source
            .acquire(&MediaConstraints {
                audio: false,
                video: false,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::MediaAccess(_)));
    }

    #[test]
    fn release_clears_the_handle() {
        let mut source = LocalMediaSource::new();
        source.acquire(&MediaConstraints::default()).unwrap();
        source.release();
        assert!(source.current().is_none());
        assert!(!source.set_enabled(MediaKind::Audio, false));
    }
}
