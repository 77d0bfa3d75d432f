//! Local Media
//!
//! Captured tracks shared read-only by every peer session, and the
//! [`LocalMediaController`] that is the only place capture state changes.

mod controller;
mod devices;

pub use controller::{LocalMediaController, OutgoingVideo};
pub use devices::{MediaDevices, ScreenCapture};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Capture source that produced a local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    const fn kind(self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Screen => TrackKind::Video,
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Microphone => "mic",
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }
}

/// A locally captured track.
///
/// Clones share the same underlying sample track and flags, so every session
/// that holds a clone sends the same media. Disabling a track mutes it at the
/// source: samples are dropped while the track stays attached.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Create a track for `source`. Audio is Opus, video is VP8.
    pub fn new(source: TrackSource) -> Self {
        let id = format!("{}-{}", source.label(), Uuid::now_v7());
        let capability = match source.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            format!("meshcall-{}", source.label()),
        ));

        Self {
            id,
            source,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
            rtc,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub const fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// The sample track handed to peer connections.
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    /// Push one captured sample. Dropped while disabled or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        self.rtc
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::Capture(e.to_string()))
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalTrack {}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A group of tracks produced by one capture request.
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            tracks,
        }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub(crate) fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// The tracks every session currently sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTrackSet {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl LocalTrackSet {
    pub const fn get(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    pub const fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Local capture flags as shown on the call controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    pub mic_enabled: bool,
    pub cam_enabled: bool,
    pub sharing_screen: bool,
}
