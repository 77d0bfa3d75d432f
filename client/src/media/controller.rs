//! Local Media Controller
//!
//! Owns camera, microphone and screen capture for the lifetime of a room.
//! Enabling or disabling a track never renegotiates; switching between camera
//! and screen hands the mesh a replacement outgoing video track.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{LocalMediaState, LocalTrackSet, MediaDevices, MediaStream, TrackKind};
use crate::error::MediaError;
use crate::media::LocalTrack;

/// Receiver of outgoing video replacements (the mesh).
pub trait OutgoingVideo: Clone + Send + Sync + 'static {
    /// Make `track` the outgoing video of every session.
    fn replace_outgoing_video(&self, track: LocalTrack);

    /// The platform ended a screen share and the camera is back.
    fn screen_share_ended(&self, _state: LocalMediaState) {}
}

struct ActiveScreenShare {
    id: u64,
    stream: MediaStream,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct MediaInner {
    camera: Option<MediaStream>,
    screen: Option<ActiveScreenShare>,
    screen_starting: bool,
    next_share_id: u64,
}

impl MediaInner {
    fn camera_track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.camera.as_ref().and_then(|s| s.track(kind))
    }

    fn state(&self) -> LocalMediaState {
        LocalMediaState {
            mic_enabled: self
                .camera_track(TrackKind::Audio)
                .is_some_and(LocalTrack::is_enabled),
            cam_enabled: self
                .camera_track(TrackKind::Video)
                .is_some_and(LocalTrack::is_enabled),
            sharing_screen: self.screen.is_some(),
        }
    }

    fn outgoing(&self) -> LocalTrackSet {
        let screen = self
            .screen
            .as_ref()
            .and_then(|s| s.stream.track(TrackKind::Video));
        LocalTrackSet {
            audio: self.camera_track(TrackKind::Audio).cloned(),
            video: screen.or_else(|| self.camera_track(TrackKind::Video)).cloned(),
        }
    }
}

/// Controller for local capture. Cheap to clone; clones share state.
pub struct LocalMediaController<D> {
    devices: Arc<D>,
    inner: Arc<Mutex<MediaInner>>,
}

impl<D> Clone for LocalMediaController<D> {
    fn clone(&self) -> Self {
        Self {
            devices: self.devices.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<D: MediaDevices> LocalMediaController<D> {
    pub fn new(devices: D) -> Self {
        Self {
            devices: Arc::new(devices),
            inner: Arc::new(Mutex::new(MediaInner::default())),
        }
    }

    /// Open camera and microphone and return the initial outgoing tracks.
    ///
    /// Calling again while capture is open returns the current tracks.
    pub async fn acquire(&self) -> Result<LocalTrackSet, MediaError> {
        if self.inner.lock().await.camera.is_some() {
            return Ok(self.outgoing_tracks().await);
        }

        let stream = self.devices.user_media().await?;
        if stream.track(TrackKind::Video).is_none() {
            stream.stop();
            return Err(MediaError::DeviceUnavailable("no camera track".into()));
        }
        if stream.track(TrackKind::Audio).is_none() {
            stream.stop();
            return Err(MediaError::DeviceUnavailable("no microphone track".into()));
        }

        let mut inner = self.inner.lock().await;
        if inner.camera.is_some() {
            stream.stop();
        } else {
            info!(stream = %stream.id, "Local media acquired");
            inner.camera = Some(stream);
        }
        Ok(inner.outgoing())
    }

    pub async fn state(&self) -> LocalMediaState {
        self.inner.lock().await.state()
    }

    /// Tracks every session should currently send.
    pub async fn outgoing_tracks(&self) -> LocalTrackSet {
        self.inner.lock().await.outgoing()
    }

    /// Mute or unmute the captured track of `kind` at its source.
    pub async fn set_enabled(
        &self,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<LocalMediaState, MediaError> {
        let inner = self.inner.lock().await;
        let track = inner.camera_track(kind).ok_or(MediaError::NotAcquired)?;
        track.set_enabled(enabled);
        info!(?kind, enabled, "Local track toggled");
        Ok(inner.state())
    }

    /// Flip the enabled flag of the captured track of `kind`.
    pub async fn toggle(&self, kind: TrackKind) -> Result<LocalMediaState, MediaError> {
        let enabled = {
            let inner = self.inner.lock().await;
            inner
                .camera_track(kind)
                .ok_or(MediaError::NotAcquired)?
                .is_enabled()
        };
        self.set_enabled(kind, !enabled).await
    }

    /// Open a screen capture and make it the outgoing video of every session.
    ///
    /// If the platform later ends the capture on its own, the camera is
    /// restored automatically.
    pub async fn start_screen_share<O: OutgoingVideo>(
        &self,
        sink: &O,
    ) -> Result<LocalMediaState, MediaError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.camera.is_none() {
                return Err(MediaError::NotAcquired);
            }
            if inner.screen.is_some() || inner.screen_starting {
                return Err(MediaError::AlreadySharing);
            }
            inner.screen_starting = true;
        }

        let capture = self.devices.display_media().await;

        let mut inner = self.inner.lock().await;
        inner.screen_starting = false;
        let capture = capture?;

        let Some(track) = capture.stream.track(TrackKind::Video).cloned() else {
            capture.stream.stop();
            return Err(MediaError::DeviceUnavailable("no screen track".into()));
        };
        if inner.camera.is_none() {
            // Released while the capture prompt was open.
            capture.stream.stop();
            return Err(MediaError::NotAcquired);
        }

        inner.next_share_id += 1;
        let id = inner.next_share_id;

        let controller = self.clone();
        let watcher_sink = sink.clone();
        let ended = capture.ended;
        let watcher = tokio::spawn(async move {
            if ended.await.is_ok() {
                info!("Screen capture ended by the platform, restoring camera");
                match controller.finish_screen_share(Some(id), &watcher_sink).await {
                    Ok(state) => watcher_sink.screen_share_ended(state),
                    Err(e) => warn!("Failed to restore camera after screen capture ended: {e}"),
                }
            }
        });

        info!(stream = %capture.stream.id, track = %track.id(), "Screen share started");
        inner.screen = Some(ActiveScreenShare {
            id,
            stream: capture.stream,
            watcher,
        });
        sink.replace_outgoing_video(track);

        Ok(inner.state())
    }

    /// Release the screen capture and restore the camera as outgoing video.
    pub async fn stop_screen_share<O: OutgoingVideo>(
        &self,
        sink: &O,
    ) -> Result<LocalMediaState, MediaError> {
        self.finish_screen_share(None, sink).await
    }

    async fn finish_screen_share<O: OutgoingVideo>(
        &self,
        share_id: Option<u64>,
        sink: &O,
    ) -> Result<LocalMediaState, MediaError> {
        let mut inner = self.inner.lock().await;

        let current = inner.screen.as_ref().map(|s| s.id);
        if current.is_none() || (share_id.is_some() && share_id != current) {
            return Err(MediaError::NotSharing);
        }
        let Some(share) = inner.screen.take() else {
            return Err(MediaError::NotSharing);
        };

        if share_id.is_none() {
            share.watcher.abort();
        }
        share.stream.stop();

        if let Some(camera) = inner.camera_track(TrackKind::Video) {
            sink.replace_outgoing_video(camera.clone());
        }
        info!("Screen share stopped");

        Ok(inner.state())
    }

    /// Stop every capture. Idempotent.
    pub async fn release(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(share) = inner.screen.take() {
            share.watcher.abort();
            share.stream.stop();
        }
        if let Some(camera) = inner.camera.take() {
            camera.stop();
            info!("Local media released");
        }
    }
}
