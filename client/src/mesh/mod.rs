//! Peer Mesh
//!
//! [`PeerMeshManager`] owns every [`PeerSession`](crate::peer::PeerSession)
//! and runs as a single actor task: signaling events, local media changes and
//! peer connection callbacks are all messages processed one at a time, so the
//! session map is never mutated from two places at once. Observers only get
//! [`MeshEvent`]s and snapshots.

mod handle;
mod manager;

pub use handle::MeshHandle;
pub use manager::PeerMeshManager;

use mesh_common::protocol::InboundSignal;
use mesh_common::{ConnectionKey, ParticipantId};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::media::{LocalTrack, LocalTrackSet};
use crate::peer::PeerView;

/// Render-facing notification about the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "peer", rename_all = "snake_case")]
pub enum MeshEvent {
    PeerJoined(PeerView),
    PeerUpdated(PeerView),
    PeerLeft(ConnectionKey),
}

/// Messages processed by the mesh actor.
#[derive(Debug)]
pub enum MeshCommand {
    ExistingParticipant {
        key: ConnectionKey,
        participant_id: Option<ParticipantId>,
    },
    NewParticipant {
        key: ConnectionKey,
        participant_id: Option<ParticipantId>,
    },
    Signal(InboundSignal),
    ParticipantLeft {
        key: ConnectionKey,
    },
    SetLocalTracks(LocalTrackSet),
    ReplaceOutgoingVideo(LocalTrack),
    Snapshot(oneshot::Sender<Vec<PeerView>>),
    Teardown(oneshot::Sender<()>),
}
