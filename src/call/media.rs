//! Local media acquisition.
//!
//! [`MediaDevices`] is the seam between call orchestration and whatever
//! actually produces audio and video. The production implementation mints
//! sample-fed local tracks with the codec capabilities the peer transport
//! registers; the embedding application pumps captured samples into them.

use crate::error::{Error, Result};
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Whether this host can produce call media at all. Callers refuse to
    /// start or accept calls when this is false.
    fn is_supported(&self) -> bool;

    /// Open capture devices for a call. `video` requests a camera track in
    /// addition to the microphone.
    async fn acquire(&self, video: bool) -> Result<Box<dyn MediaSession>>;
}

/// A live set of capture devices, held for the duration of one call.
pub trait MediaSession: Send + Sync {
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);
    fn audio_enabled(&self) -> bool;
    fn video_enabled(&self) -> bool;

    /// Local tracks to attach to the peer transport.
    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>>;

    /// Stop capture and free the devices. Idempotent.
    fn release(&mut self);
}

pub struct SystemMediaDevices;

#[async_trait]
impl MediaDevices for SystemMediaDevices {
    fn is_supported(&self) -> bool {
        true
    }

    async fn acquire(&self, video: bool) -> Result<Box<dyn MediaSession>> {
        Ok(Box::new(DeviceMediaSession::open(video)?))
    }
}

/// Sample-fed tracks standing in for the platform capture pipeline. The
/// embedder writes opus and vp8 samples into the tracks; the enabled flags
/// gate whether it should.
pub struct DeviceMediaSession {
    audio: Arc<TrackLocalStaticSample>,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    released: bool,
}

impl DeviceMediaSession {
    fn open(video: bool) -> Result<Self> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "linkup-audio".to_owned(),
        ));
        let video_track = video.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_owned(),
                "linkup-video".to_owned(),
            ))
        });
        Ok(Self {
            audio,
            video: video_track,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(video),
            released: false,
        })
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video.clone()
    }
}

impl MediaSession for DeviceMediaSession {
    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = vec![self.audio.clone()];
        if let Some(video) = &self.video {
            tracks.push(video.clone());
        }
        tracks
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.audio_enabled.store(false, Ordering::SeqCst);
        self.video_enabled.store(false, Ordering::SeqCst);
        debug!("Capture devices released");
    }
}

/// Stub for hosts with no capture hardware. `acquire` always fails, so calls
/// are refused up front by the support check.
pub struct NoMediaDevices;

#[async_trait]
impl MediaDevices for NoMediaDevices {
    fn is_supported(&self) -> bool {
        false
    }

    async fn acquire(&self, _video: bool) -> Result<Box<dyn MediaSession>> {
        Err(Error::MediaUnsupported)
    }
}
