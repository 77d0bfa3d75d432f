//! Peer Connection Seam
//!
//! The mesh drives peer connections only through [`PeerConnection`]; the
//! connection reports back through a [`PeerEventSink`] whose events are queued
//! into the mesh actor, never handled in the callback itself.

use async_trait::async_trait;
use mesh_common::{ConnectionKey, IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::NegotiationError;
use crate::media::{LocalTrack, TrackKind};

/// Transport-level state reported by a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the session is discarded. No reconnection is
    /// attempted.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Descriptor of one received remote track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Media received from a remote participant, as handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrackInfo>,
}

/// Something a peer connection observed.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and must reach the remote side.
    LocalCandidate(IceCandidate),
    /// Local candidate gathering finished.
    GatheringComplete,
    /// A remote media track arrived.
    RemoteTrack(RemoteTrackInfo),
    /// The connection changed state.
    StateChanged(ConnectionState),
}

/// A [`PeerEvent`] tagged with the session that produced it.
#[derive(Debug, Clone)]
pub struct PeerEnvelope {
    pub key: ConnectionKey,
    /// Distinguishes sessions that reused a key after a close.
    pub session_id: u64,
    pub event: PeerEvent,
}

/// Where a peer connection reports its events.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    key: ConnectionKey,
    session_id: u64,
    tx: mpsc::UnboundedSender<PeerEnvelope>,
}

impl PeerEventSink {
    pub fn new(
        key: ConnectionKey,
        session_id: u64,
        tx: mpsc::UnboundedSender<PeerEnvelope>,
    ) -> Self {
        Self {
            key,
            session_id,
            tx,
        }
    }

    pub const fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Queue an event for the mesh. Dropped if the mesh has stopped.
    pub fn emit(&self, event: PeerEvent) {
        let envelope = PeerEnvelope {
            key: self.key.clone(),
            session_id: self.session_id,
            event,
        };
        if self.tx.send(envelope).is_err() {
            debug!(key = %self.key, "Mesh stopped, dropping peer event");
        }
    }
}

/// A single negotiated media transport to one remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// Attach a local track for sending.
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Create a sender of `kind` with no media attached yet.
    async fn add_sender(&self, kind: TrackKind) -> Result<(), NegotiationError>;

    /// Swap the track on the sender of the same kind without renegotiating.
    async fn replace_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Detach the track from the sender of `kind`. The sender is kept.
    async fn clear_track(&self, kind: TrackKind) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Release the underlying transport.
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Creates peer connections wired to report into the mesh.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync + 'static {
    type Connection: PeerConnection;

    async fn create(&self, events: PeerEventSink) -> Result<Self::Connection, NegotiationError>;
}
