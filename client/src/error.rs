//! Client Errors
//!
//! Failures are scoped: per-peer negotiation failures close that peer's
//! session and never leave the mesh, while local media and signaling
//! transport failures are room-fatal and reach the UI as [`RoomError`].

use thiserror::Error;

use crate::peer::NegotiationState;

/// Local capture errors. Fatal to joining a room.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied for media capture")]
    AccessDenied,
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Local media has not been acquired")]
    NotAcquired,
    #[error("Already sharing screen")]
    AlreadySharing,
    #[error("Not sharing screen")]
    NotSharing,
    #[error("Capture error: {0}")]
    Capture(String),
}

/// Signaling transport errors.
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Signaling channel disconnected")]
    Disconnected,
    #[error("Failed to connect to signaling server: {0}")]
    Connect(String),
    #[error("Failed to encode signaling event: {0}")]
    Encode(#[from] mesh_common::Error),
}

/// Per-session negotiation errors. Resolved by closing that session only.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("Track error: {0}")]
    Track(String),
    #[error("Peer connection error: {0}")]
    PeerConnection(String),
    #[error("ICE candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("Cannot {action} in state {state:?}")]
    InvalidState {
        state: NegotiationState,
        action: &'static str,
    },
    #[error("Malformed signal: {0}")]
    Payload(#[from] mesh_common::Error),
    #[error("Session closed")]
    Closed,
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        Self::PeerConnection(err.to_string())
    }
}

/// Errors surfaced to the UI layer.
#[derive(Error, Debug)]
pub enum RoomError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("Already left the room")]
    AlreadyLeft,
    #[error("Mesh coordinator stopped")]
    MeshStopped,
}
