//! Capture Devices
//!
//! Device acquisition is platform specific; the controller only needs these
//! two requests.

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::MediaStream;
use crate::error::MediaError;

/// Platform capture entry points.
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    /// Open camera and microphone. The stream carries one audio and one
    /// video track.
    async fn user_media(&self) -> Result<MediaStream, MediaError>;

    /// Open a screen capture source.
    async fn display_media(&self) -> Result<ScreenCapture, MediaError>;
}

/// An opened screen capture.
#[derive(Debug)]
pub struct ScreenCapture {
    /// Stream holding the screen video track.
    pub stream: MediaStream,
    /// Resolves when the platform ends the capture on its own (the system
    /// "stop sharing" control). Dropping the sender means no such signal.
    pub ended: oneshot::Receiver<()>,
}
